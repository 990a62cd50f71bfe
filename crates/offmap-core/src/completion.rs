//! Single-shot cancel completion

use crate::engine::CancelCallback;
use crate::error::OffmapError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// A completion callback that runs at most once
///
/// Every `fire` after the first is ignored.
pub struct CancelCompletion {
    fired: AtomicBool,
    callback: Mutex<Option<CancelCallback>>,
}

impl CancelCompletion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<(), OffmapError>) + Send + 'static,
    {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Invoke the callback with `result`; returns false if it already ran
    pub fn fire(&self, result: Result<(), OffmapError>) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            warn!("Ignoring repeated cancel completion");
            return false;
        }

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CancelCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelCompletion")
            .field("fired", &self.has_fired())
            .finish()
    }
}
