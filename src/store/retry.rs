//! Capped exponential backoff over transient store failures.

use std::time::Duration;

use tracing::warn;

use super::{BlobMeta, BlobStore, ConnectionInfo};
use crate::ctx::Context;
use crate::error::Result;

/// Retries idempotent operations (get, put, list) when the inner store
/// reports a transient failure. Deletes are not retried.
///
/// Puts are safe to retry here because every blob the repository writes is
/// either content-addressed or write-once with fixed bytes.
pub struct Retrying<S> {
    inner: S,
    attempts: u32,
    base_delay: Duration,
}

const MAX_DELAY: Duration = Duration::from_secs(8);

impl<S: BlobStore> Retrying<S> {
    pub fn new(inner: S) -> Self {
        Self::with_policy(inner, 5, Duration::from_millis(100))
    }

    pub fn with_policy(inner: S, attempts: u32, base_delay: Duration) -> Self {
        assert!(attempts > 0);
        Self {
            inner,
            attempts,
            base_delay,
        }
    }

    fn run<T>(&self, ctx: &Context, what: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            ctx.check()?;
            match f() {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!("{what} failed ({e}); retrying in {delay:?}");
                    ctx.sleep(delay)?;
                    delay = (delay * 2).min(MAX_DELAY);
                    attempt += 1;
                }
                done => return done,
            }
        }
    }
}

impl<S: BlobStore> BlobStore for Retrying<S> {
    fn get(&self, ctx: &Context, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        self.run(ctx, name, || self.inner.get(ctx, name, offset, length))
    }

    fn put(&self, ctx: &Context, name: &str, bytes: &[u8]) -> Result<()> {
        self.run(ctx, name, || self.inner.put(ctx, name, bytes))
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.inner.delete(ctx, name)
    }

    fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<BlobMeta>> {
        self.run(ctx, "list", || self.inner.list(ctx, prefix))
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
