//! Cooperative cancellation flag shared between the issuer of a run and the
//! loop executing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One-way cancellation flag.
///
/// Clones share the same flag. Once cancelled it stays cancelled; a new run
/// always gets a new token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancel: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
