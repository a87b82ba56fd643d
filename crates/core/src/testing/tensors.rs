//! Host-memory tensor and ready-event doubles.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::tensor::{DataType, ReadyEvent, Tensor};

/// A tensor whose "device" memory is a host byte vector, enabling
/// deterministic pipeline tests without real GPU state. Backends downcast
/// to it through `Tensor::as_any`.
pub struct HostTensor {
    data: Mutex<Vec<u8>>,
    dtype: DataType,
}

impl HostTensor {
    pub fn zeroed(len: usize, dtype: DataType) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len]),
            dtype,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, dtype: DataType) -> Self {
        Self {
            data: Mutex::new(bytes),
            dtype,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock().unwrap()[offset..offset + len].to_vec()
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        self.data.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Tensor for HostTensor {
    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Ready event toggled by the test body.
#[derive(Default)]
pub struct ManualReadyEvent {
    ready: AtomicBool,
}

impl ManualReadyEvent {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

impl ReadyEvent for ManualReadyEvent {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
