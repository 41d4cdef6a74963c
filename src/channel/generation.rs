use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of session generations. Advancing it invalidates every
/// [`Generation`] handed out before.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    live: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation
    pub fn advance(&self) -> Generation {
        let value = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            value,
            live: self.live.clone(),
        }
    }

    pub fn current(&self) -> Generation {
        Generation {
            value: self.live.load(Ordering::SeqCst),
            live: self.live.clone(),
        }
    }
}

/// Tag carried by channels and their asynchronous continuations
#[derive(Debug, Clone)]
pub struct Generation {
    value: u64,
    live: Arc<AtomicU64>,
}

impl Generation {
    /// A generation with its own counter, for channels not owned by a manager
    pub fn standalone() -> Self {
        GenerationCounter::new().advance()
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_current(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.value
    }
}
