//! Per-tensor registration state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::tensor::PinnedBuffer;

/// Partition layout fixed at declare time: total byte length and one slice
/// key per partition, in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLayout {
    pub size: usize,
    pub key_list: Vec<u32>,
}

/// Immutable-after-init descriptor for one named tensor.
///
/// Created lazily on first registration of the name; the layout and pinned
/// buffer latch exactly once, and `initialized` transitions false -> true
/// exactly once when `enqueue_tensor_init` completes.
pub struct TensorContext {
    name: String,
    layout: OnceLock<TensorLayout>,
    cpubuff: OnceLock<Arc<PinnedBuffer>>,
    /// True when the buffer was supplied by the caller rather than
    /// allocated by the engine.
    reuse_buff: AtomicBool,
    initialized: AtomicBool,
}

impl TensorContext {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: OnceLock::new(),
            cpubuff: OnceLock::new(),
            reuse_buff: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> Option<&TensorLayout> {
        self.layout.get()
    }

    /// Latch the partition layout. Returns false if a layout was already set
    /// (the existing one wins).
    pub(crate) fn set_layout(&self, layout: TensorLayout) -> bool {
        self.layout.set(layout).is_ok()
    }

    pub fn buffer(&self) -> Option<&Arc<PinnedBuffer>> {
        self.cpubuff.get()
    }

    pub(crate) fn set_buffer(&self, buf: Arc<PinnedBuffer>, reuse: bool) {
        if self.cpubuff.set(buf).is_ok() {
            self.reuse_buff.store(reuse, Ordering::Release);
        }
    }

    /// Whether the pinned buffer is caller-owned (and must not be released
    /// by the engine at shutdown).
    pub fn reuses_caller_buffer(&self) -> bool {
        self.reuse_buff.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for TensorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorContext")
            .field("name", &self.name)
            .field("layout", &self.layout.get())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_latches_once() {
        let ctx = TensorContext::new("grad.0");
        assert!(ctx.layout().is_none());
        assert!(ctx.set_layout(TensorLayout {
            size: 8,
            key_list: vec![0, 1],
        }));
        assert!(!ctx.set_layout(TensorLayout {
            size: 16,
            key_list: vec![2],
        }));
        assert_eq!(ctx.layout().unwrap().key_list, vec![0, 1]);
    }

    #[test]
    fn initialized_flag_transitions() {
        let ctx = TensorContext::new("grad.1");
        assert!(!ctx.is_initialized());
        ctx.mark_initialized();
        assert!(ctx.is_initialized());
    }

    #[test]
    fn buffer_records_ownership() {
        let ctx = TensorContext::new("grad.2");
        ctx.set_buffer(Arc::new(PinnedBuffer::zeroed(4)), true);
        assert!(ctx.reuses_caller_buffer());
        assert_eq!(ctx.buffer().unwrap().len(), 4);
    }
}
