//! Parameter-server client seam and key encoding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::tensor::{DataType, PinnedBuffer, Tensor};

/// PS-side addressing for one slice: parallel key/length arrays under one
/// logical slice key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsKeyMap {
    pub keys: Vec<u64>,
    pub lens: Vec<usize>,
}

/// Request families multiplexed over the PS surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    DefaultPushPull = 0,
    RowSparsePushPull = 1,
    CompressedPushPull = 2,
}

/// Pack the request kind and element type into the PS command word.
pub fn command_for(kind: RequestKind, dtype: DataType) -> i32 {
    (dtype.code() << 4) | kind as i32
}

/// Where a slice's bytes live for PS transfer. GPU tasks stage through the
/// pinned buffer; CPU-device tasks transfer tensor memory directly.
#[derive(Clone)]
pub enum SliceSource {
    Pinned(Arc<PinnedBuffer>),
    Tensor(Arc<dyn Tensor>),
}

/// Byte window handed to the PS client. Holding the `SliceData` keeps its
/// source alive until the transfer's completion closure has run.
#[derive(Clone)]
pub struct SliceData {
    pub source: SliceSource,
    pub offset: usize,
    pub len: usize,
}

/// Completion continuation for an asynchronous PS transfer.
pub type PsCompletion = Box<dyn FnOnce() + Send + 'static>;

/// Asynchronous parameter-server client.
///
/// Contract: the client invokes each transfer's completion exactly once,
/// after the bytes described by `data` have been fully sent (push) or
/// fully written (pull). Completions may run on client-owned threads and
/// re-enter the engine's queues, so they must not hold client locks.
pub trait PsClient: Send + Sync {
    /// Issue an asynchronous push of `data` under `keys`.
    fn push(&self, keys: &PsKeyMap, data: SliceData, cmd: i32, done: PsCompletion);

    /// Issue an asynchronous pull into `data` under `keys`.
    fn pull(&self, keys: &PsKeyMap, data: SliceData, cmd: i32, done: PsCompletion);

    /// Push and wait for completion. Used on the init path only.
    fn push_sync(&self, keys: &PsKeyMap, data: SliceData, cmd: i32);

    /// Block until every worker in the group has reached the barrier.
    fn barrier(&self);
}

/// Deterministic slice-key -> PS-key assignment, cached per slice key.
///
/// Each slice key is owned by server `key % num_servers`; the PS key packs
/// the server ordinal above the slice key so server-side key spaces never
/// collide.
pub struct PsKeyEncoder {
    num_servers: u64,
    cache: Mutex<HashMap<u32, PsKeyMap>>,
}

impl PsKeyEncoder {
    pub fn new(num_servers: usize) -> Self {
        Self {
            num_servers: num_servers.max(1) as u64,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn encode_default_key(&self, key: u32, len: usize) -> PsKeyMap {
        let mut cache = self.cache.lock().unwrap();
        let entry = cache.entry(key).or_insert_with(|| {
            let server = key as u64 % self.num_servers;
            PsKeyMap {
                keys: vec![(server << 32) | key as u64],
                lens: vec![len],
            }
        });
        debug_assert_eq!(
            entry.lens[0], len,
            "slice key {key} re-encoded with a different length"
        );
        entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_packs_kind_and_dtype() {
        let cmd = command_for(RequestKind::DefaultPushPull, DataType::Float32);
        assert_eq!(cmd & 0xf, 0);
        assert_eq!(cmd >> 4, 5);
        let cmd = command_for(RequestKind::CompressedPushPull, DataType::Float16);
        assert_eq!(cmd & 0xf, 2);
        assert_eq!(cmd >> 4, 4);
    }

    #[test]
    fn encoder_shards_by_server() {
        let enc = PsKeyEncoder::new(4);
        let a = enc.encode_default_key(5, 100);
        assert_eq!(a.keys, vec![(1u64 << 32) | 5]);
        assert_eq!(a.lens, vec![100]);
        let b = enc.encode_default_key(8, 64);
        assert_eq!(b.keys, vec![8]);
    }

    #[test]
    fn encoder_caches_per_key() {
        let enc = PsKeyEncoder::new(2);
        let a = enc.encode_default_key(3, 42);
        let b = enc.encode_default_key(3, 42);
        assert_eq!(a, b);
    }
}
