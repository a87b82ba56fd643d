//! Intra-host signaling between the root rank and its followers.
//!
//! The channel is FIFO per sender: followers announce slice availability
//! with `ReduceReady`/`BcastReady`, and the root brackets each collective
//! group with `DoReduce`/`DoBroadcast` broadcasts followed by one
//! `DoGroup`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{EngineError, Result};
use crate::task::Stage;

/// Control-plane signal codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ReduceReady,
    BcastReady,
    DoReduce,
    DoBroadcast,
    DoGroup,
}

impl Signal {
    pub fn code(self) -> i32 {
        match self {
            Self::ReduceReady => 0,
            Self::BcastReady => 1,
            Self::DoReduce => 2,
            Self::DoBroadcast => 3,
            Self::DoGroup => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::ReduceReady),
            1 => Some(Self::BcastReady),
            2 => Some(Self::DoReduce),
            3 => Some(Self::DoBroadcast),
            4 => Some(Self::DoGroup),
            _ => None,
        }
    }
}

/// One control-plane message. `key` is unused for `DoGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMessage {
    /// Local rank of the sender.
    pub src: i32,
    pub signal: Signal,
    pub key: i32,
}

impl SignalMessage {
    /// On-the-wire length: three little-endian i32 fields.
    pub const WIRE_LEN: usize = 12;

    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&self.src.to_le_bytes());
        buf[4..8].copy_from_slice(&self.signal.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.key.to_le_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8; Self::WIRE_LEN]) -> Result<Self> {
        let src = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let code = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let key = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        let signal = Signal::from_code(code)
            .ok_or_else(|| EngineError::Backend(format!("unknown signal code {code}")))?;
        Ok(Self { src, signal, key })
    }
}

/// Intra-host control-plane endpoint for one local rank.
///
/// Delivery must be FIFO per sender. `recv_signal` takes a timeout so loop
/// threads can poll the shutdown flag while parked.
pub trait HostComm: Send + Sync {
    fn local_rank(&self) -> usize;

    /// Send to one peer.
    fn send_signal(&self, dst: usize, msg: SignalMessage) -> Result<()>;

    /// Send to every other local rank. No-op when this host has no peers.
    fn broadcast_signal(&self, msg: SignalMessage) -> Result<()>;

    /// Receive the next message addressed to this rank, or `None` on
    /// timeout.
    fn recv_signal(&self, timeout: Duration) -> Option<SignalMessage>;
}

/// In-process channel fabric connecting the local ranks of one host.
pub struct LocalHostComm {
    rank: usize,
    peers: Vec<Sender<SignalMessage>>,
    rx: Receiver<SignalMessage>,
}

impl LocalHostComm {
    /// Build one connected endpoint per local rank.
    pub fn hub(local_size: usize) -> Vec<LocalHostComm> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..local_size).map(|_| unbounded()).unzip();
        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalHostComm {
                rank,
                peers: txs.clone(),
                rx,
            })
            .collect()
    }
}

impl HostComm for LocalHostComm {
    fn local_rank(&self) -> usize {
        self.rank
    }

    fn send_signal(&self, dst: usize, msg: SignalMessage) -> Result<()> {
        let tx = self
            .peers
            .get(dst)
            .ok_or_else(|| EngineError::Backend(format!("no local rank {dst}")))?;
        tx.send(msg)
            .map_err(|_| EngineError::Backend(format!("signal channel to rank {dst} closed")))
    }

    fn broadcast_signal(&self, msg: SignalMessage) -> Result<()> {
        for dst in 0..self.peers.len() {
            if dst != self.rank {
                self.send_signal(dst, msg)?;
            }
        }
        Ok(())
    }

    fn recv_signal(&self, timeout: Duration) -> Option<SignalMessage> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Root-side view of follower readiness.
///
/// The listen loop counts `ReduceReady`/`BcastReady` per `(stage, key)`;
/// the collective driver only drains a task once every follower has
/// announced it, which is what guarantees the follower-side
/// `get_task_by_key` always finds its entry.
#[derive(Default)]
pub struct ReadyTable {
    counts: Mutex<HashMap<(Stage, u32), usize>>,
}

impl ReadyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, stage: Stage, key: u32) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry((stage, key)).or_insert(0) += 1;
    }

    pub fn is_ready(&self, stage: Stage, key: u32, need: usize) -> bool {
        if need == 0 {
            return true;
        }
        self.counts
            .lock()
            .unwrap()
            .get(&(stage, key))
            .is_some_and(|&c| c >= need)
    }

    /// Clear the announcements consumed by one drained task.
    pub fn consume(&self, stage: Stage, key: u32, need: usize) {
        if need == 0 {
            return;
        }
        let mut counts = self.counts.lock().unwrap();
        if let Some(c) = counts.get_mut(&(stage, key)) {
            *c = c.saturating_sub(need);
            if *c == 0 {
                counts.remove(&(stage, key));
            }
        }
    }
}
