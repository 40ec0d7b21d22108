use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use embedinfer_core::NativeResponse;
use tracing::debug;

/// Completed engine responses kept alive until an explicit clear.
///
/// Results read output bytes straight out of these responses. Each result
/// also holds its own reference, so clearing the registry never invalidates
/// a result that is still in use: the engine reclaims a response once the
/// registry and every result built from it have let go.
#[derive(Default)]
pub struct ResponseRegistry {
    completed: Mutex<Vec<Arc<dyn NativeResponse>>>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&self, response: Arc<dyn NativeResponse>) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response);
    }

    pub fn len(&self) -> usize {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every retained response and returns how many there were.
    /// Calling it again with nothing retained is a no-op.
    pub fn clear_completed(&self) -> usize {
        let drained = std::mem::take(
            &mut *self
                .completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = drained.len();
        // Responses run allocator release callbacks on drop; do that outside the lock.
        drop(drained);
        if count > 0 {
            debug!(count, "released completed responses");
        }
        count
    }
}

impl fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRegistry")
            .field("completed", &self.len())
            .finish()
    }
}
