//! Splitting a submission into fixed-bound pipeline slices.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::task::{PartCounter, SliceTask, Stage, StatusCallback};
use crate::tensor::{PinnedBuffer, ReadyEvent, Tensor};

/// A validated submission, ready to be partitioned. Every scalar attribute
/// is inherited by each slice.
pub(crate) struct Submission {
    pub name: String,
    pub size: usize,
    pub key_list: Vec<u32>,
    pub tensor: Option<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub cpubuff: Option<Arc<PinnedBuffer>>,
    pub device: i32,
    pub priority: i32,
    pub version: i32,
    pub callback: StatusCallback,
    pub stage_list: Vec<Stage>,
}

/// Split a submission into `ceil(size / bound)` consecutive byte slices.
///
/// Slice `i` is named `"{name}_{i}"`, takes its key positionally from the
/// context's key list, and shares one completion counter with its
/// siblings. Fails before producing anything when the slice count does not
/// match the declared key list.
pub(crate) fn partition_submission(sub: Submission, bound: usize) -> Result<Vec<Arc<SliceTask>>> {
    let parts = sub.size.div_ceil(bound);
    if parts != sub.key_list.len() {
        return Err(EngineError::KeyCountMismatch {
            name: sub.name,
            parts,
            keys: sub.key_list.len(),
        });
    }

    let counter = Arc::new(PartCounter::new());
    let mut slices = Vec::with_capacity(parts);
    let mut accumulated = 0usize;
    let mut i = 0usize;
    while accumulated < sub.size {
        let len = (sub.size - accumulated).min(bound);
        slices.push(Arc::new(SliceTask::new(
            format!("{}_{}", sub.name, i),
            sub.key_list[i],
            accumulated,
            len,
            sub.device,
            sub.priority,
            sub.version,
            sub.tensor.clone(),
            sub.output.clone(),
            sub.ready_event.clone(),
            sub.cpubuff.clone(),
            Arc::clone(&counter),
            parts,
            Arc::clone(&sub.callback),
            sub.stage_list.clone(),
        )));
        accumulated += len;
        i += 1;
    }
    debug_assert_eq!(accumulated, sub.size);
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(size: usize, keys: Vec<u32>) -> Submission {
        Submission {
            name: "grad".into(),
            size,
            key_list: keys,
            tensor: None,
            output: None,
            ready_event: None,
            cpubuff: None,
            device: 0,
            priority: 3,
            version: 1,
            callback: Arc::new(|_| {}),
            stage_list: vec![Stage::Reduce, Stage::Broadcast],
        }
    }

    #[test]
    fn exact_bound_is_one_slice() {
        let slices = partition_submission(submission(1024, vec![0]), 1024).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].offset, 0);
        assert_eq!(slices[0].len, 1024);
        assert_eq!(slices[0].name, "grad_0");
    }

    #[test]
    fn one_past_bound_adds_tail_slice() {
        let slices = partition_submission(submission(1025, vec![0, 1]), 1024).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len, 1024);
        assert_eq!(slices[1].offset, 1024);
        assert_eq!(slices[1].len, 1);
    }

    #[test]
    fn multiple_of_bound_splits_evenly() {
        let slices = partition_submission(submission(4096, vec![0, 1, 2, 3]), 1024).unwrap();
        assert_eq!(slices.len(), 4);
        for (i, s) in slices.iter().enumerate() {
            assert_eq!(s.len, 1024);
            assert_eq!(s.offset, i * 1024);
            assert_eq!(s.key, i as u32);
        }
        let total: usize = slices.iter().map(|s| s.len).sum();
        assert_eq!(total, 4096);
    }

    #[test]
    fn slices_inherit_parent_attributes() {
        let slices = partition_submission(submission(2048, vec![7, 9]), 1024).unwrap();
        assert_eq!(slices[1].key, 9);
        assert_eq!(slices[1].priority, 3);
        assert_eq!(slices[1].version, 1);
        assert_eq!(slices[1].total_partnum, 2);
        assert_eq!(slices[1].current_stage(), Some(Stage::Reduce));
        // Siblings share one counter.
        slices[0].counter.advance();
        assert_eq!(slices[1].counter.value(), 1);
    }

    #[test]
    fn key_count_mismatch_rejected_before_enqueue() {
        let err = partition_submission(submission(3000, vec![0, 1]), 1024).unwrap_err();
        assert!(matches!(err, EngineError::KeyCountMismatch { .. }));
    }
}
