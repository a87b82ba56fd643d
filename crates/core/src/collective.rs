//! Collective and copy backend seams, plus the in-flight group tracker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::task::{SliceTask, Stage};
use crate::tensor::{PinnedBuffer, Tensor};

/// Completion marker recorded on the collective stream after `group_end`.
pub trait CollectiveEvent: Send {
    /// Block until every call in the group has completed on the stream.
    fn synchronize(&self) -> Result<()>;
}

/// Opaque intra-host collective library (e.g. NCCL behind FFI).
///
/// Calls between `group_start` and `group_end` are batched and submitted
/// as one unit on the library's stream; `record_event` captures the
/// group's completion.
pub trait Collective: Send + Sync {
    fn group_start(&self);

    fn group_end(&self) -> Result<()>;

    /// Reduce `len` bytes at `offset` of `tensor` onto the root rank,
    /// in place.
    fn reduce(&self, tensor: &dyn Tensor, offset: usize, len: usize, root: usize) -> Result<()>;

    /// Broadcast `len` bytes at `offset` of `tensor` from the root rank,
    /// in place.
    fn broadcast(&self, tensor: &dyn Tensor, offset: usize, len: usize, root: usize) -> Result<()>;

    /// Record a blocking completion event on the collective stream.
    fn record_event(&self) -> Result<Box<dyn CollectiveEvent>>;
}

/// Device <-> pinned-host transfer engine. Each direction runs on its own
/// dedicated stream and both sides address the same `(offset, len)` window.
pub trait CopyEngine: Send + Sync {
    /// Copy `len` device bytes at `offset` of `src` into `dst` at the same
    /// offset, then synchronize the copy stream.
    fn copy_d2h(&self, src: &dyn Tensor, offset: usize, len: usize, dst: &PinnedBuffer)
        -> Result<()>;

    /// Copy `len` host bytes at `offset` of `src` into `dst` at the same
    /// offset, then synchronize the copy stream.
    fn copy_h2d(&self, src: &PinnedBuffer, offset: usize, len: usize, dst: &dyn Tensor)
        -> Result<()>;
}

/// One submitted collective group: its tasks in submission order, the
/// source queue of each task (root only; followers record none), and the
/// completion event.
pub struct GroupEntry {
    pub tasks: Vec<Arc<SliceTask>>,
    pub queues: Vec<Stage>,
    pub event: Box<dyn CollectiveEvent>,
}

/// FIFO of in-flight groups. Single producer (the rank's collective
/// driver), single consumer (the sync loop); groups are synchronized in
/// the exact order they were enqueued, which establishes the cross-group
/// happens-before for task advancement.
#[derive(Default)]
pub struct GroupTracker {
    inner: Mutex<VecDeque<GroupEntry>>,
}

impl GroupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, entry: GroupEntry) {
        self.inner.lock().unwrap().push_back(entry);
    }

    pub fn dequeue(&self) -> Option<GroupEntry> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopEvent;

    impl CollectiveEvent for NoopEvent {
        fn synchronize(&self) -> Result<()> {
            Ok(())
        }
    }

    fn entry() -> GroupEntry {
        GroupEntry {
            tasks: Vec::new(),
            queues: Vec::new(),
            event: Box::new(NoopEvent),
        }
    }

    #[test]
    fn tracker_is_fifo() {
        let tracker = GroupTracker::new();
        let mut a = entry();
        a.queues.push(Stage::Reduce);
        let mut b = entry();
        b.queues.push(Stage::Broadcast);
        tracker.enqueue(a);
        tracker.enqueue(b);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.dequeue().unwrap().queues, vec![Stage::Reduce]);
        assert_eq!(tracker.dequeue().unwrap().queues, vec![Stage::Broadcast]);
        assert!(tracker.dequeue().is_none());
    }
}
