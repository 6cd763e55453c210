use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counting latch that releases once every added unit is marked done.
///
/// A latch created with one unit acts as a sentinel: it cannot release
/// until that unit is explicitly released, however many other units come
/// and go in the meantime.
pub(crate) struct CompletionLatch {
    pending: AtomicUsize,
    released: Notify,
}

impl CompletionLatch {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            pending: AtomicUsize::new(initial),
            released: Notify::new(),
        }
    }

    pub(crate) fn add(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "completion latch released more often than added");
        if prev == 1 {
            self.released.notify_one();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        while self.pending() > 0 {
            self.released.notified().await;
        }
    }
}
