//! Flushed end of the history log, shared with the index writers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// End of the part of the log that has reached the file.
///
/// The log writer raises it on every flush. Batch workers only commit
/// offset lists whose offsets all lie below it, so a committed index entry
/// never names a record still sitting in the writer's buffer.
#[derive(Debug, Clone)]
pub struct LogWatermark(Arc<AtomicU64>);

impl LogWatermark {
    #[must_use]
    pub fn new(position: u64) -> Self {
        Self(Arc::new(AtomicU64::new(position)))
    }

    /// Admits every offset. For indexes used without a log.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the watermark to `position`. Never moves it backwards.
    pub fn publish(&self, position: u64) {
        self.0.fetch_max(position, Ordering::AcqRel);
    }

    /// True when a record starting at `offset` is already in the file.
    #[must_use]
    pub fn admits(&self, offset: u64) -> bool {
        offset < self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_moves_forward() {
        let watermark = LogWatermark::new(128);
        let shared = watermark.clone();
        assert!(!watermark.admits(128));

        shared.publish(400);
        assert!(watermark.admits(128));
        assert!(watermark.admits(399));
        assert!(!watermark.admits(400));

        shared.publish(200);
        assert_eq!(watermark.get(), 400);
        assert!(LogWatermark::unbounded().admits(u64::MAX - 1));
    }
}
