//! Per-call context carrying the cancellation signal.
//!
//! Every I/O entry point checks the context so long scans and deep tree
//! recursion can be interrupted by the caller. Commit publication is the one
//! exception: once validation passes, publish runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Cancellation-aware call context.
#[derive(Clone, Debug, Default)]
pub struct Ctx {
    cancel: Arc<AtomicBool>,
}

impl Ctx {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context with a handle the caller can trip from another thread.
    pub fn cancellable() -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancel: Arc::clone(&flag),
            },
            CancelHandle { cancel: flag },
        )
    }

    /// Fail with [`Error::Cancelled`] if the context has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Returns true once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Owner side of a cancellable context.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    cancel: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Trip the cancellation flag; all future checks fail.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_cancels() {
        let ctx = Ctx::background();
        assert!(ctx.check().is_ok());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn cancel_handle_trips_checks() {
        let (ctx, handle) = Ctx::cancellable();
        assert!(ctx.check().is_ok());
        handle.cancel();
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
        assert!(ctx.is_cancelled());
    }
}
