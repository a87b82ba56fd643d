//! Shared test utilities: host-memory tensors, recording backends, and an
//! in-memory parameter server for end-to-end pipeline tests.

mod backends;
mod tensors;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use backends::{
    CollectiveCall, CollectiveOp, HostCopyEngine, InstantEvent, MockPsClient, RecordingCollective,
    RecordingComm,
};
pub use tensors::{HostTensor, ManualReadyEvent};

use crate::comm::HostComm;
use crate::engine::Backends;
use crate::ps::PsClient;
use crate::tensor::HeapPinnedAllocator;

/// Assemble a backend set around mock implementations. Returns the
/// collective so tests can inspect recorded groups.
pub fn mock_backends(
    comm: Arc<dyn HostComm>,
    ps: Option<Arc<MockPsClient>>,
) -> (Backends, Arc<RecordingCollective>) {
    let collective = Arc::new(RecordingCollective::new());
    let backends = Backends {
        collective: Arc::clone(&collective) as _,
        copy: Arc::new(HostCopyEngine),
        comm,
        ps: ps.map(|p| p as Arc<dyn PsClient>),
        allocator: Arc::new(HeapPinnedAllocator),
    };
    (backends, collective)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
