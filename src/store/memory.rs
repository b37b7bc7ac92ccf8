//! A store that keeps everything in name-addressed buffers.
//!
//! Great for testing: shareable between "writers" via `Arc`, with knobs for
//! injecting faults and counting writes.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{BlobMeta, BlobStore, ConnectionInfo};
use crate::ctx::Context;
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Blob>>,
    puts: AtomicUsize,
    fault: Mutex<FaultPlan>,
}

struct Blob {
    bytes: Vec<u8>,
    timestamp: i64,
}

#[derive(Default)]
struct FaultPlan {
    skip: usize,
    fail: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many puts have succeeded so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    /// Let the next `skip` puts through, then fail `fail` of them
    /// with [`Error::StorageUnavailable`].
    pub fn fail_puts(&self, skip: usize, fail: usize) {
        *self.fault.lock().unwrap() = FaultPlan { skip, fail };
    }

    /// Flip one byte of a stored blob. For testing corruption detection.
    pub fn flip_byte(&self, name: &str, offset: usize) {
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs.get_mut(name).expect("no such blob to corrupt");
        blob.bytes[offset] ^= 0xff;
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, ctx: &Context, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        ctx.check()?;
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(name)
            .ok_or_else(|| Error::not_found(format!("blob {name}")))?;
        let start = (offset as usize).min(blob.bytes.len());
        let end = match length {
            Some(l) => (start + l as usize).min(blob.bytes.len()),
            None => blob.bytes.len(),
        };
        Ok(blob.bytes[start..end].to_vec())
    }

    fn put(&self, ctx: &Context, name: &str, bytes: &[u8]) -> Result<()> {
        ctx.check()?;
        {
            let mut fault = self.fault.lock().unwrap();
            if fault.skip > 0 {
                fault.skip -= 1;
            } else if fault.fail > 0 {
                fault.fail -= 1;
                return Err(Error::unavailable(format!("injected failure putting {name}")));
            }
        }
        self.blobs.lock().unwrap().insert(
            name.to_owned(),
            Blob {
                bytes: bytes.to_vec(),
                timestamp: chrono::Utc::now().timestamp(),
            },
        );
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.check()?;
        self.blobs
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("blob {name}")))
    }

    fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<BlobMeta>> {
        ctx.check()?;
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, blob)| BlobMeta {
                name: name.clone(),
                length: blob.bytes.len() as u64,
                timestamp: blob.timestamp,
            })
            .collect())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::Memory
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smoke() -> Result<()> {
        let ctx = Context::new();
        let store = MemoryStore::new();
        store.put(&ctx, "pdeadbeef", b"pack bytes")?;
        store.put(&ctx, "n01", b"index bytes")?;

        assert_eq!(store.get(&ctx, "pdeadbeef", 0, None)?, b"pack bytes");
        assert_eq!(store.get(&ctx, "pdeadbeef", 5, Some(5))?, b"bytes");
        assert!(matches!(
            store.get(&ctx, "nope", 0, None),
            Err(Error::NotFound(_))
        ));

        let indexes = store.list(&ctx, "n")?;
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "n01");
        assert_eq!(indexes[0].length, 11);

        store.delete(&ctx, "n01")?;
        assert!(store.list(&ctx, "n")?.is_empty());
        Ok(())
    }

    #[test]
    fn fault_injection() {
        let ctx = Context::new();
        let store = MemoryStore::new();
        store.fail_puts(1, 1);
        store.put(&ctx, "a", b"1").unwrap();
        assert!(store.put(&ctx, "b", b"2").unwrap_err().is_transient());
        store.put(&ctx, "b", b"2").unwrap();
        assert_eq!(store.put_count(), 2);
    }

    #[test]
    fn cancelled_context_stops_everything() {
        let ctx = Context::new();
        ctx.cancel();
        let store = MemoryStore::new();
        assert!(matches!(
            store.put(&ctx, "a", b"1"),
            Err(Error::Cancelled)
        ));
    }
}
