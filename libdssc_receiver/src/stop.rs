use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop token shared by the Sorter and its worker threads.
///
/// Workers poll the token between blocking calls. Blocking calls themselves are woken by
/// exiting the pools, so the token alone never interrupts a wait.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Clear the token before the workers are started again
    pub fn rearm(&self) {
        self.stopped.store(false, Ordering::Release);
    }
}
