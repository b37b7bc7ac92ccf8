//! Blob stores: the dumb object storage the repository is built over.
//!
//! A store is last-writer-wins with no transactions; a put of identical
//! bytes may be repeated freely, and listings may lag writes. The refresh
//! protocol upstairs tolerates stale listings because every blob is
//! content-addressed - a stale list delays visibility, it can't corrupt.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::ctx::Context;
use crate::error::Result;

pub mod fs;
pub mod memory;
mod retry;
mod semaphored;

pub use retry::Retrying;
pub use semaphored::Semaphored;

/// A blob as reported by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub name: String,
    pub length: u64,
    /// Store-side modification time, seconds since the epoch.
    pub timestamp: i64,
}

/// The capability set the repository needs from storage:
/// get, put, delete, list, plus enough info to reconnect.
pub trait BlobStore: Send + Sync {
    /// Read `length` bytes starting at `offset`, or everything from `offset`
    /// when `length` is `None`.
    fn get(&self, ctx: &Context, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;

    /// Create or replace. Durable once this returns.
    fn put(&self, ctx: &Context, name: &str, bytes: &[u8]) -> Result<()>;

    fn delete(&self, ctx: &Context, name: &str) -> Result<()>;

    /// All blobs whose names start with `prefix`.
    fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<BlobMeta>>;

    /// How to reconnect to this store; persisted in the repository config.
    fn connection_info(&self) -> ConnectionInfo;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// Wrappers and managers hold stores behind an Arc; let the Arc be a store too.
impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    fn get(&self, ctx: &Context, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        (**self).get(ctx, name, offset, length)
    }

    fn put(&self, ctx: &Context, name: &str, bytes: &[u8]) -> Result<()> {
        (**self).put(ctx, name, bytes)
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        (**self).delete(ctx, name)
    }

    fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<BlobMeta>> {
        (**self).list(ctx, prefix)
    }

    fn connection_info(&self) -> ConnectionInfo {
        (**self).connection_info()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Tagged connection document persisted in the repository config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionInfo {
    Filesystem { path: Utf8PathBuf },
    /// Volatile; only useful inside one process (and its tests).
    Memory,
}

/// Open a store from its connection document.
pub fn open(info: &ConnectionInfo) -> Result<Arc<dyn BlobStore>> {
    match info {
        ConnectionInfo::Filesystem { path } => Ok(Arc::new(fs::FilesystemStore::open(path)?)),
        ConnectionInfo::Memory => Ok(Arc::new(memory::MemoryStore::new())),
    }
}
