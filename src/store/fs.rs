//! A store backed by a local directory.
//!
//! Blobs are flat files named by their blob name. Puts land in a temp file
//! and rename into place, so a crashed writer never leaves a partial blob
//! under a final name.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use super::{BlobMeta, BlobStore, ConnectionInfo};
use crate::ctx::Context;
use crate::error::{Error, Result};

pub struct FilesystemStore {
    root: Utf8PathBuf,
}

impl FilesystemStore {
    /// Create the backing directory (if needed) and open it.
    pub fn create(root: impl AsRef<Utf8Path>) -> Result<Self> {
        let root = root.as_ref().to_owned();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::unavailable(format!("couldn't create {root}: {e}")))?;
        Ok(Self { root })
    }

    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self> {
        let root = root.as_ref().to_owned();
        if !root.is_dir() {
            return Err(Error::not_found(format!("store directory {root}")));
        }
        Ok(Self { root })
    }

    fn blob_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }
}

fn map_io(name: &str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::not_found(format!("blob {name}"))
    } else {
        Error::unavailable(format!("blob {name}: {e}"))
    }
}

impl BlobStore for FilesystemStore {
    fn get(&self, ctx: &Context, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        ctx.check()?;
        let path = self.blob_path(name);
        let mut fh = File::open(&path).map_err(|e| map_io(name, e))?;
        fh.seek(SeekFrom::Start(offset))
            .map_err(|e| map_io(name, e))?;
        let mut bytes = Vec::new();
        match length {
            Some(l) => fh
                .take(l)
                .read_to_end(&mut bytes)
                .map_err(|e| map_io(name, e))?,
            None => fh.read_to_end(&mut bytes).map_err(|e| map_io(name, e))?,
        };
        Ok(bytes)
    }

    fn put(&self, ctx: &Context, name: &str, bytes: &[u8]) -> Result<()> {
        ctx.check()?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".part-")
            .tempfile_in(&self.root)
            .map_err(|e| Error::unavailable(format!("couldn't open temp file: {e}")))?;
        tmp.write_all(bytes).map_err(|e| map_io(name, e))?;
        tmp.as_file().sync_all().map_err(|e| map_io(name, e))?;
        let path = self.blob_path(name);
        tmp.persist(&path)
            .map_err(|e| Error::unavailable(format!("couldn't persist {path}: {e}")))?;
        debug!("wrote {name} ({} bytes)", bytes.len());
        Ok(())
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.check()?;
        std::fs::remove_file(self.blob_path(name)).map_err(|e| map_io(name, e))
    }

    fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<BlobMeta>> {
        ctx.check()?;
        let mut found = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| Error::unavailable(format!("couldn't list {}: {e}", self.root)))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::unavailable(format!("couldn't list: {e}")))?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            // Skip in-flight temp files and anything else we didn't write.
            if !name.starts_with(prefix) || name.starts_with(".part-") {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| Error::unavailable(format!("couldn't stat {name}: {e}")))?;
            if !meta.is_file() {
                continue;
            }
            let timestamp = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            found.push(BlobMeta {
                name,
                length: meta.len(),
                timestamp,
            });
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::Filesystem {
            path: self.root.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FilesystemStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("repo");
        let store = FilesystemStore::create(&root).unwrap();
        (dir, store)
    }

    #[test]
    fn round_trip_and_list() -> Result<()> {
        let ctx = Context::new();
        let (_dir, store) = temp_store();

        store.put(&ctx, "pcafe", b"some pack")?;
        store.put(&ctx, "n123", b"an index")?;
        assert_eq!(store.get(&ctx, "pcafe", 0, None)?, b"some pack");
        assert_eq!(store.get(&ctx, "pcafe", 5, Some(4))?, b"pack");

        let names: Vec<String> = store.list(&ctx, "n")?.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["n123"]);

        store.delete(&ctx, "n123")?;
        assert!(matches!(
            store.get(&ctx, "n123", 0, None),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn replace_is_allowed() -> Result<()> {
        let ctx = Context::new();
        let (_dir, store) = temp_store();
        store.put(&ctx, "pcafe", b"same bytes")?;
        store.put(&ctx, "pcafe", b"same bytes")?;
        assert_eq!(store.get(&ctx, "pcafe", 0, None)?, b"same bytes");
        Ok(())
    }

    #[test]
    fn open_missing_directory_fails() {
        assert!(FilesystemStore::open("/definitely/not/here").is_err());
    }
}
