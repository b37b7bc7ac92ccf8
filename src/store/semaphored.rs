//! Bound the number of in-flight store operations.
//!
//! Bulk work (refresh, manifest loads) fans out with rayon; this keeps the
//! fan-out from turning into hundreds of simultaneous backend requests.

use std::sync::{Condvar, Mutex};

use super::{BlobMeta, BlobStore, ConnectionInfo};
use crate::ctx::Context;
use crate::error::Result;

pub struct Semaphored<S> {
    inner: S,
    permits: Mutex<u32>,
    returned: Condvar,
}

impl<S: BlobStore> Semaphored<S> {
    pub fn new(inner: S, concurrency: u32) -> Self {
        assert!(concurrency > 0);
        Self {
            inner,
            permits: Mutex::new(concurrency),
            returned: Condvar::new(),
        }
    }

    /// Take a permit, sleeping on the condvar until one is returned.
    fn acquire(&self) -> Permit<'_, S> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.returned.wait(permits).unwrap();
        }
        *permits -= 1;
        Permit { store: self }
    }
}

struct Permit<'a, S> {
    store: &'a Semaphored<S>,
}

impl<S> Drop for Permit<'_, S> {
    fn drop(&mut self) {
        *self.store.permits.lock().unwrap() += 1;
        self.store.returned.notify_one();
    }
}

impl<S: BlobStore> BlobStore for Semaphored<S> {
    fn get(&self, ctx: &Context, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let _permit = self.acquire();
        self.inner.get(ctx, name, offset, length)
    }

    fn put(&self, ctx: &Context, name: &str, bytes: &[u8]) -> Result<()> {
        let _permit = self.acquire();
        self.inner.put(ctx, name, bytes)
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        let _permit = self.acquire();
        self.inner.delete(ctx, name)
    }

    fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<BlobMeta>> {
        let _permit = self.acquire();
        self.inner.list(ctx, prefix)
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
