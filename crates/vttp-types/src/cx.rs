//! Capability context threaded through calls that may block on I/O.
//!
//! A [`Cx`] is cloned into each cursor. Clones share one cancellation flag,
//! so cancelling any of them interrupts the fetch the others are waiting on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vttp_error::{Result, VttpError};

#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Yield point: fails with [`VttpError::Interrupted`] once cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancel_requested() {
            return Err(VttpError::Interrupted);
        }
        Ok(())
    }
}
