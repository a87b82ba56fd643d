//! Pipeline stages, slice tasks, and the per-tensor completion counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Status;
use crate::tensor::{PinnedBuffer, ReadyEvent, Tensor, CPU_DEVICE_ID};

/// One processing step of the pipeline. Each stage owns a scheduled queue
/// and (on the ranks where it applies) a loop thread draining it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Follower-side announcement preceding the reduce half.
    CoordReduce,
    Reduce,
    CopyD2H,
    Push,
    Pull,
    CopyH2D,
    /// Follower-side announcement preceding the broadcast half.
    CoordBroadcast,
    Broadcast,
}

impl Stage {
    pub const COUNT: usize = 8;

    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::CoordReduce,
        Stage::Reduce,
        Stage::CopyD2H,
        Stage::Push,
        Stage::Pull,
        Stage::CopyH2D,
        Stage::CoordBroadcast,
        Stage::Broadcast,
    ];

    pub fn index(self) -> usize {
        match self {
            Stage::CoordReduce => 0,
            Stage::Reduce => 1,
            Stage::CopyD2H => 2,
            Stage::Push => 3,
            Stage::Pull => 4,
            Stage::CopyH2D => 5,
            Stage::CoordBroadcast => 6,
            Stage::Broadcast => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::CoordReduce => "coord_reduce",
            Stage::Reduce => "reduce",
            Stage::CopyD2H => "copy_d2h",
            Stage::Push => "push",
            Stage::Pull => "pull",
            Stage::CopyH2D => "copy_h2d",
            Stage::CoordBroadcast => "coord_broadcast",
            Stage::Broadcast => "broadcast",
        }
    }
}

/// Callback invoked exactly once per submission when its last slice leaves
/// the pipeline (or immediately, for submissions with no stages).
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// Shared atomic fence across the slices of one submission.
///
/// Constructed at 0 and never reused. The caller of [`advance`] that
/// observes `total_partnum - 1` owns the callback invocation.
///
/// [`advance`]: PartCounter::advance
#[derive(Debug, Default)]
pub struct PartCounter {
    count: AtomicUsize,
}

impl PartCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the pre-increment value.
    pub fn advance(&self) -> usize {
        self.count.fetch_add(1, Ordering::AcqRel)
    }

    pub fn value(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// One pipeline unit: a contiguous byte range of a submitted tensor.
///
/// The head of `queue_list` is the stage that currently owns the slice;
/// advancement pops it and hands the slice to the queue of the new head.
pub struct SliceTask {
    /// Parent tensor name suffixed with the partition index.
    pub name: String,
    pub key: u32,
    pub offset: usize,
    pub len: usize,
    pub device: i32,
    pub priority: i32,
    pub version: i32,
    pub tensor: Option<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub cpubuff: Option<Arc<PinnedBuffer>>,
    pub counter: Arc<PartCounter>,
    pub total_partnum: usize,
    pub callback: StatusCallback,
    queue_list: Mutex<VecDeque<Stage>>,
}

impl SliceTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        key: u32,
        offset: usize,
        len: usize,
        device: i32,
        priority: i32,
        version: i32,
        tensor: Option<Arc<dyn Tensor>>,
        output: Option<Arc<dyn Tensor>>,
        ready_event: Option<Arc<dyn ReadyEvent>>,
        cpubuff: Option<Arc<PinnedBuffer>>,
        counter: Arc<PartCounter>,
        total_partnum: usize,
        callback: StatusCallback,
        queue_list: Vec<Stage>,
    ) -> Self {
        Self {
            name,
            key,
            offset,
            len,
            device,
            priority,
            version,
            tensor,
            output,
            ready_event,
            cpubuff,
            counter,
            total_partnum,
            callback,
            queue_list: Mutex::new(queue_list.into()),
        }
    }

    /// Stage currently owning this slice, if any remain.
    pub fn current_stage(&self) -> Option<Stage> {
        self.queue_list.lock().unwrap().front().copied()
    }

    pub(crate) fn pop_stage(&self) -> Option<Stage> {
        self.queue_list.lock().unwrap().pop_front()
    }

    pub fn remaining_stages(&self) -> usize {
        self.queue_list.lock().unwrap().len()
    }

    pub fn is_gpu(&self) -> bool {
        self.device != CPU_DEVICE_ID
    }
}

impl std::fmt::Debug for SliceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceTask")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("device", &self.device)
            .field("priority", &self.priority)
            .field("stages", &self.remaining_stages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> StatusCallback {
        Arc::new(|_| {})
    }

    fn task_with_stages(stages: Vec<Stage>) -> SliceTask {
        SliceTask::new(
            "t_0".into(),
            0,
            0,
            128,
            0,
            0,
            0,
            None,
            None,
            None,
            None,
            Arc::new(PartCounter::new()),
            1,
            noop_callback(),
            stages,
        )
    }

    #[test]
    fn counter_reports_pre_increment() {
        let c = PartCounter::new();
        assert_eq!(c.advance(), 0);
        assert_eq!(c.advance(), 1);
        assert_eq!(c.value(), 2);
    }

    #[test]
    fn queue_list_pops_from_head() {
        let task = task_with_stages(vec![Stage::Reduce, Stage::Broadcast]);
        assert_eq!(task.current_stage(), Some(Stage::Reduce));
        assert_eq!(task.pop_stage(), Some(Stage::Reduce));
        assert_eq!(task.current_stage(), Some(Stage::Broadcast));
        assert_eq!(task.remaining_stages(), 1);
        assert_eq!(task.pop_stage(), Some(Stage::Broadcast));
        assert_eq!(task.pop_stage(), None);
    }

    #[test]
    fn cpu_device_detection() {
        let mut task = task_with_stages(vec![]);
        assert!(task.is_gpu());
        task.device = CPU_DEVICE_ID;
        assert!(!task.is_gpu());
    }

    #[test]
    fn stage_indices_are_dense() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }
}
