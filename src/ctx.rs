//! Cooperative cancellation, threaded through every blocking call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A cancellation signal and optional deadline shared by related operations.
///
/// Cloning yields a handle to the same signal. Everything that touches the
/// blob store, the local cache, or waits on a flush worker checks it;
/// pure in-memory index operations do not.
///
/// Cancellation never corrupts invariants: blocks already staged in the
/// pending pack stay valid and ride along with the next flush.
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Signal cancellation to every clone of this context.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns [`Error::Cancelled`] once the context is done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep in short slices so cancellation stays prompt.
    pub(crate) fn sleep(&self, how_long: Duration) -> Result<()> {
        const SLICE: Duration = Duration::from_millis(20);
        let until = Instant::now() + how_long;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(until - now));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancel_reaches_clones() {
        let ctx = Context::new();
        let clone = ctx.clone();
        assert!(ctx.check().is_ok());
        clone.cancel();
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn deadline_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(0));
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn sleep_respects_cancellation() {
        let ctx = Context::new();
        ctx.cancel();
        assert!(ctx.sleep(Duration::from_secs(5)).is_err());
    }
}
