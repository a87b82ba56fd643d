//! Priority-aware per-stage task queues with credit admission and finish
//! accounting.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::{SliceTask, Stage};

/// Ordering key: higher user priority drains first, FIFO within a priority
/// level via a per-queue sequence number.
///
/// Note the convention differs from request-serving schedulers (where a
/// lower value wins): submission priorities here are "bigger is more
/// urgent", matching how training frameworks prioritize later layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    /// Negated priority so the BTreeMap's ascending order yields
    /// highest-priority first.
    neg_priority: i64,
    seq: u64,
}

impl OrderKey {
    fn new(priority: i32, seq: u64) -> Self {
        Self {
            neg_priority: -(priority as i64),
            seq,
        }
    }
}

struct QueueInner {
    pending: BTreeMap<OrderKey, Arc<SliceTask>>,
    by_key: HashMap<u32, OrderKey>,
    next_seq: u64,
    /// Bytes handed out but not yet reported finished; only consulted when
    /// a credit window is configured.
    in_flight: u64,
}

/// FIFO-within-priority backlog for one stage.
///
/// Thread-safe for multiple producers and the owning stage loop as
/// consumer; `get_task_by_key` additionally races with `add_task` from the
/// follower coordinate loops and is serialized by the same lock.
pub struct ScheduledQueue {
    stage: Stage,
    credit_bytes: Option<u64>,
    inner: Mutex<QueueInner>,
    bytes_added: AtomicU64,
    bytes_finished: AtomicU64,
}

impl ScheduledQueue {
    pub fn new(stage: Stage, credit_bytes: Option<u64>) -> Self {
        Self {
            stage,
            credit_bytes,
            inner: Mutex::new(QueueInner {
                pending: BTreeMap::new(),
                by_key: HashMap::new(),
                next_seq: 0,
                in_flight: 0,
            }),
            bytes_added: AtomicU64::new(0),
            bytes_finished: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Insert a task, preserving priority order with FIFO tie-breaking.
    pub fn add_task(&self, task: Arc<SliceTask>) {
        let mut inner = self.inner.lock().unwrap();
        let key = OrderKey::new(task.priority, inner.next_seq);
        inner.next_seq += 1;
        self.bytes_added.fetch_add(task.len as u64, Ordering::AcqRel);
        tracing::trace!(
            stage = self.stage.name(),
            tensor = %task.name,
            key = task.key,
            len = task.len,
            "queue add"
        );
        inner.by_key.insert(task.key, key);
        inner.pending.insert(key, task);
    }

    /// Pop the highest-priority, earliest-enqueued task. Returns `None`
    /// when the queue is empty or the credit window is exhausted.
    pub fn get_task(&self) -> Option<Arc<SliceTask>> {
        self.take_first(|_| true)
    }

    /// Pop the first task (in drain order) satisfying `pred`. Used by the
    /// root collective driver to respect follower readiness.
    pub fn get_task_where(&self, pred: impl Fn(&SliceTask) -> bool) -> Option<Arc<SliceTask>> {
        self.take_first(pred)
    }

    /// Remove and return the task with slice key `key`.
    ///
    /// The intra-host protocol guarantees the entry is present (followers
    /// advance a task into this queue before announcing it); absence is an
    /// unrecoverable protocol violation.
    pub fn get_task_by_key(&self, key: u32) -> Arc<SliceTask> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.by_key.remove(&key).unwrap_or_else(|| {
            panic!(
                "stage {} has no pending task for key {key}",
                self.stage.name()
            )
        });
        let task = inner
            .pending
            .remove(&order)
            .expect("key index out of sync with pending map");
        inner.in_flight += task.len as u64;
        task
    }

    /// Record completion of this stage's work for `n_bytes`. Never blocks.
    pub fn report_finish(&self, n_bytes: u64) {
        self.bytes_finished.fetch_add(n_bytes, Ordering::AcqRel);
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(n_bytes);
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    /// Total bytes ever enqueued.
    pub fn bytes_added(&self) -> u64 {
        self.bytes_added.load(Ordering::Acquire)
    }

    /// Total bytes ever reported finished.
    pub fn bytes_finished(&self) -> u64 {
        self.bytes_finished.load(Ordering::Acquire)
    }

    fn take_first(&self, pred: impl Fn(&SliceTask) -> bool) -> Option<Arc<SliceTask>> {
        let mut inner = self.inner.lock().unwrap();
        let (order, len) = {
            let mut found = None;
            for (order, task) in inner.pending.iter() {
                if pred(task) {
                    found = Some((*order, task.len as u64));
                    break;
                }
            }
            found?
        };
        if let Some(window) = self.credit_bytes {
            // Admit at least one task even when it alone exceeds the window.
            if inner.in_flight > 0 && inner.in_flight + len > window {
                return None;
            }
        }
        let task = inner
            .pending
            .remove(&order)
            .expect("pending entry vanished under lock");
        inner.by_key.remove(&task.key);
        inner.in_flight += len;
        Some(task)
    }
}
