//! In-memory watermark committer.

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::core::{Watermark, WatermarkCommitter};

/// Committer that keeps every distinct committed watermark.
///
/// Repeated commits of the current watermark are no-ops and lower watermarks are
/// ignored, so the committed position never regresses.
#[derive(Debug, Default)]
pub struct InMemoryCommitter {
    history: Mutex<Vec<Watermark>>,
}

impl InMemoryCommitter {
    /// Create a committer with nothing committed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest committed watermark.
    pub fn last(&self) -> Option<Watermark> {
        self.history.lock().last().copied()
    }

    /// Every distinct watermark committed, in order.
    pub fn history(&self) -> Vec<Watermark> {
        self.history.lock().clone()
    }
}

impl WatermarkCommitter for InMemoryCommitter {
    fn commit(&self, watermark: Watermark) {
        let mut history = self.history.lock();
        match history.last() {
            Some(last) if watermark == *last => {}
            Some(last) if watermark < *last => {
                warn!(current = %last, received = %watermark, "ignoring watermark regression");
            }
            _ => {
                trace!(lsn = %watermark, "watermark committed");
                history.push(watermark);
            }
        }
    }
}
