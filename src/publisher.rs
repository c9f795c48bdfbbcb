//! Published per-instance frame counters.
//!
//! Each capture instance owns one slot. The slot is written by exactly one
//! party, the instance's frame-end deferred handler, with a single release
//! store after all bookkeeping for the frame is finished. Readers poll with an
//! acquire load and need no other synchronization: observing value `n`
//! guarantees the bookkeeping of frame `n` and every earlier frame is done.
//!
//! Slots of different instances are independent; no ordering across
//! instances is implied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Number of instance slots in a publisher.
pub const MAX_INSTANCES: usize = 8;

static GLOBAL: Lazy<Arc<FrameCountPublisher>> = Lazy::new(|| Arc::new(FrameCountPublisher::new()));

/// Fixed table of published frame counts, one slot per instance.
#[derive(Debug)]
pub struct FrameCountPublisher {
    slots: [AtomicU64; MAX_INSTANCES],
}

impl Default for FrameCountPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCountPublisher {
    /// Create a publisher with every slot at zero.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Process-wide publisher polled by status tooling.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Last completed frame number of `instance`, or `None` for an unknown instance.
    pub fn read(&self, instance: u32) -> Option<u64> {
        self.slot(instance).map(|slot| slot.load(Ordering::Acquire))
    }

    /// Snapshot of every slot.
    pub fn snapshot(&self) -> [u64; MAX_INSTANCES] {
        std::array::from_fn(|i| self.slots[i].load(Ordering::Acquire))
    }

    /// Writer handle for `instance`, or `None` if it has no slot.
    pub(crate) fn writer(self: &Arc<Self>, instance: u32) -> Option<PublishSlot> {
        self.slot(instance)?;
        Some(PublishSlot {
            publisher: Arc::clone(self),
            index: instance as usize,
        })
    }

    fn slot(&self, instance: u32) -> Option<&AtomicU64> {
        self.slots.get(instance as usize)
    }
}

/// Write side of one instance's slot.
#[derive(Debug)]
pub(crate) struct PublishSlot {
    publisher: Arc<FrameCountPublisher>,
    index: usize,
}

impl PublishSlot {
    fn cell(&self) -> &AtomicU64 {
        &self.publisher.slots[self.index]
    }

    /// Publish `frame` as the last completed frame.
    ///
    /// The value never moves backwards while a session runs; a stale snapshot
    /// arriving late leaves the slot unchanged.
    pub(crate) fn publish(&self, frame: u64) {
        self.cell().fetch_max(frame, Ordering::Release);
    }

    /// Zero the slot at the start of a session.
    pub(crate) fn reset(&self) {
        self.cell().store(0, Ordering::Release);
    }

    pub(crate) fn load(&self) -> u64 {
        self.cell().load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_independent() {
        let publisher = Arc::new(FrameCountPublisher::new());
        let w0 = publisher.writer(0).unwrap();
        let w2 = publisher.writer(2).unwrap();

        w0.publish(5);
        w2.publish(9);
        assert_eq!(publisher.read(0), Some(5));
        assert_eq!(publisher.read(1), Some(0));
        assert_eq!(publisher.read(2), Some(9));
        assert_eq!(publisher.read(MAX_INSTANCES as u32), None);
        assert!(publisher.writer(MAX_INSTANCES as u32).is_none());
    }

    #[test]
    fn test_publish_is_monotonic() {
        let publisher = Arc::new(FrameCountPublisher::new());
        let writer = publisher.writer(1).unwrap();
        writer.publish(7);
        writer.publish(3);
        assert_eq!(publisher.read(1), Some(7));

        writer.reset();
        assert_eq!(writer.load(), 0);
    }
}
