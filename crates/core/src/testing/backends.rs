//! Mock backend implementations for pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::collective::{Collective, CollectiveEvent, CopyEngine};
use crate::comm::{HostComm, SignalMessage};
use crate::error::{EngineError, Result};
use crate::ps::{PsClient, PsCompletion, PsKeyMap, SliceData, SliceSource};
use crate::tensor::{PinnedBuffer, Tensor};

use super::tensors::HostTensor;

/// Event that is already complete when synchronized.
pub struct InstantEvent;

impl CollectiveEvent for InstantEvent {
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    Reduce,
    Broadcast,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectiveCall {
    pub op: CollectiveOp,
    pub offset: usize,
    pub len: usize,
    pub root: usize,
}

/// Collective double that records every issued call, grouped by
/// group_start/group_end brackets. Empty groups (idle driver passes) are
/// not recorded.
#[derive(Default)]
pub struct RecordingCollective {
    current: Mutex<Vec<CollectiveCall>>,
    groups: Mutex<Vec<Vec<CollectiveCall>>>,
}

impl RecordingCollective {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes of the non-empty groups submitted so far, in order.
    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn calls(&self) -> Vec<CollectiveCall> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.groups.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl Collective for RecordingCollective {
    fn group_start(&self) {}

    fn group_end(&self) -> Result<()> {
        let mut current = self.current.lock().unwrap();
        if !current.is_empty() {
            self.groups.lock().unwrap().push(std::mem::take(&mut *current));
        }
        Ok(())
    }

    fn reduce(&self, _tensor: &dyn Tensor, offset: usize, len: usize, root: usize) -> Result<()> {
        self.current.lock().unwrap().push(CollectiveCall {
            op: CollectiveOp::Reduce,
            offset,
            len,
            root,
        });
        Ok(())
    }

    fn broadcast(&self, _tensor: &dyn Tensor, offset: usize, len: usize, root: usize) -> Result<()> {
        self.current.lock().unwrap().push(CollectiveCall {
            op: CollectiveOp::Broadcast,
            offset,
            len,
            root,
        });
        Ok(())
    }

    fn record_event(&self) -> Result<Box<dyn CollectiveEvent>> {
        Ok(Box::new(InstantEvent))
    }
}

/// Copy engine moving bytes between [`HostTensor`]s and pinned buffers.
#[derive(Debug, Default)]
pub struct HostCopyEngine;

fn host_tensor(t: &dyn Tensor) -> Result<&HostTensor> {
    t.as_any()
        .downcast_ref::<HostTensor>()
        .ok_or_else(|| EngineError::Backend("copy engine expects HostTensor handles".into()))
}

impl CopyEngine for HostCopyEngine {
    fn copy_d2h(
        &self,
        src: &dyn Tensor,
        offset: usize,
        len: usize,
        dst: &PinnedBuffer,
    ) -> Result<()> {
        let src = host_tensor(src)?;
        dst.write(offset, &src.read_at(offset, len));
        Ok(())
    }

    fn copy_h2d(
        &self,
        src: &PinnedBuffer,
        offset: usize,
        len: usize,
        dst: &dyn Tensor,
    ) -> Result<()> {
        let dst = host_tensor(dst)?;
        dst.write_at(offset, src.slice(offset, len));
        Ok(())
    }
}

/// In-memory parameter server with immediate completion delivery.
///
/// `hanging()` builds a variant that accepts transfers but never completes
/// them, for shutdown-mid-flight tests; parked completions are dropped
/// unrun so the tasks they retain are released without advancing.
pub struct MockPsClient {
    store: Mutex<HashMap<u64, Vec<u8>>>,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    barriers: AtomicUsize,
    hang: bool,
    parked: Mutex<Vec<PsCompletion>>,
}

impl MockPsClient {
    pub fn new() -> Self {
        Self::build(false)
    }

    pub fn hanging() -> Self {
        Self::build(true)
    }

    fn build(hang: bool) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            pushes: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            barriers: AtomicUsize::new(0),
            hang,
            parked: Mutex::new(Vec::new()),
        }
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::Acquire)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::Acquire)
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers.load(Ordering::Acquire)
    }

    /// Server-side bytes stored under a PS key.
    pub fn stored(&self, ps_key: u64) -> Option<Vec<u8>> {
        self.store.lock().unwrap().get(&ps_key).cloned()
    }

    fn read_source(data: &SliceData) -> Vec<u8> {
        match &data.source {
            SliceSource::Pinned(buf) => buf.slice(data.offset, data.len).to_vec(),
            SliceSource::Tensor(t) => t
                .as_any()
                .downcast_ref::<HostTensor>()
                .expect("mock PS expects HostTensor sources")
                .read_at(data.offset, data.len),
        }
    }

    fn write_target(data: &SliceData, bytes: &[u8]) {
        match &data.source {
            SliceSource::Pinned(buf) => buf.write(data.offset, bytes),
            SliceSource::Tensor(t) => t
                .as_any()
                .downcast_ref::<HostTensor>()
                .expect("mock PS expects HostTensor targets")
                .write_at(data.offset, bytes),
        }
    }
}

impl Default for MockPsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PsClient for MockPsClient {
    fn push(&self, keys: &PsKeyMap, data: SliceData, _cmd: i32, done: PsCompletion) {
        self.pushes.fetch_add(1, Ordering::AcqRel);
        if self.hang {
            self.parked.lock().unwrap().push(done);
            return;
        }
        let bytes = Self::read_source(&data);
        self.store.lock().unwrap().insert(keys.keys[0], bytes);
        done();
    }

    fn pull(&self, keys: &PsKeyMap, data: SliceData, _cmd: i32, done: PsCompletion) {
        self.pulls.fetch_add(1, Ordering::AcqRel);
        if self.hang {
            self.parked.lock().unwrap().push(done);
            return;
        }
        let bytes = self
            .store
            .lock()
            .unwrap()
            .get(&keys.keys[0])
            .cloned()
            .unwrap_or_else(|| vec![0u8; data.len]);
        Self::write_target(&data, &bytes);
        done();
    }

    fn push_sync(&self, keys: &PsKeyMap, data: SliceData, _cmd: i32) {
        self.pushes.fetch_add(1, Ordering::AcqRel);
        let bytes = Self::read_source(&data);
        self.store.lock().unwrap().insert(keys.keys[0], bytes);
    }

    fn barrier(&self) {
        self.barriers.fetch_add(1, Ordering::AcqRel);
    }
}

/// Decorator recording every outgoing signal, for asserting protocol
/// traffic (e.g. that no `Do*` broadcast happens with one local rank).
pub struct RecordingComm {
    inner: Arc<dyn HostComm>,
    sent: Mutex<Vec<SignalMessage>>,
}

impl RecordingComm {
    pub fn new(inner: Arc<dyn HostComm>) -> Self {
        Self {
            inner,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl HostComm for RecordingComm {
    fn local_rank(&self) -> usize {
        self.inner.local_rank()
    }

    fn send_signal(&self, dst: usize, msg: SignalMessage) -> Result<()> {
        self.sent.lock().unwrap().push(msg);
        self.inner.send_signal(dst, msg)
    }

    fn broadcast_signal(&self, msg: SignalMessage) -> Result<()> {
        self.sent.lock().unwrap().push(msg);
        self.inner.broadcast_signal(msg)
    }

    fn recv_signal(&self, timeout: std::time::Duration) -> Option<SignalMessage> {
        self.inner.recv_signal(timeout)
    }
}
