use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::analysis::record::CaptureBatch;

struct CachedBatch {
    batch: Arc<CaptureBatch>,
    stored_at: Instant,
}

/// Holds the most recent capture batch.
///
/// Batches are built off-lock and swapped in whole, so readers always see
/// either the previous batch or the new one.
#[derive(Default)]
pub struct CaptureCache {
    current: RwLock<Option<CachedBatch>>,
}

impl CaptureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current batch if it was stored no longer than `max_age` ago
    pub fn get(&self, max_age: Duration) -> Option<Arc<CaptureBatch>> {
        self.read()
            .as_ref()
            .filter(|cached| cached.stored_at.elapsed() <= max_age)
            .map(|cached| Arc::clone(&cached.batch))
    }

    /// The current batch regardless of age
    pub fn latest(&self) -> Option<Arc<CaptureBatch>> {
        self.read().as_ref().map(|cached| Arc::clone(&cached.batch))
    }

    /// Publish `batch`, replacing whatever was cached
    pub fn replace(&self, batch: CaptureBatch) -> Arc<CaptureBatch> {
        let batch = Arc::new(batch);
        *self.write() = Some(CachedBatch {
            batch: Arc::clone(&batch),
            stored_at: Instant::now(),
        });
        batch
    }

    /// Time since the current batch was stored
    pub fn age(&self) -> Option<Duration> {
        self.read().as_ref().map(|cached| cached.stored_at.elapsed())
    }

    pub fn is_populated(&self) -> bool {
        self.read().is_some()
    }

    // The slot is only ever written by a single assignment, so a poisoned
    // lock still guards a whole batch.
    fn read(&self) -> RwLockReadGuard<'_, Option<CachedBatch>> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<CachedBatch>> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
