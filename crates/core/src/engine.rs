//! Engine: global registry, topology, and lifecycle.
//!
//! One `Engine` instance owns the per-stage queues, the tensor contexts,
//! the backend seams, and the loop threads. Framework adapters reach it
//! either directly or through the module-level accessor installed with
//! [`install`]; the accessor refuses to hand out an engine that has been
//! shut down, so use-after-shutdown is an immediate error instead of
//! undefined behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::collective::{Collective, CopyEngine, GroupTracker};
use crate::comm::{HostComm, ReadyTable};
use crate::config::EngineConfig;
use crate::context::{TensorContext, TensorLayout};
use crate::error::{EngineError, Result, Status};
use crate::loops;
use crate::partition::{partition_submission, Submission};
use crate::ps::{
    command_for, PsClient, PsKeyEncoder, PsKeyMap, RequestKind, SliceData, SliceSource,
};
use crate::queue::ScheduledQueue;
use crate::task::{Stage, StatusCallback};
use crate::tensor::{DataType, PinnedAllocator, PinnedBuffer, ReadyEvent, Tensor};

/// Backend implementations wired in at init time.
pub struct Backends {
    pub collective: Arc<dyn Collective>,
    pub copy: Arc<dyn CopyEngine>,
    pub comm: Arc<dyn HostComm>,
    /// Required when `distributed` is set; unused otherwise.
    pub ps: Option<Arc<dyn PsClient>>,
    pub allocator: Arc<dyn PinnedAllocator>,
}

pub struct Engine {
    config: EngineConfig,
    backends: Backends,
    queues: Vec<Arc<ScheduledQueue>>,
    tracker: GroupTracker,
    ready: ReadyTable,
    key_encoder: PsKeyEncoder,
    contexts: RwLock<HashMap<String, Arc<TensorContext>>>,
    next_key: AtomicU32,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Construct the engine and spawn the role-dependent loop set.
    ///
    /// Root, non-distributed: collective driver + sync. Root, distributed:
    /// additionally the copy and PS loops. Followers: both coordinate
    /// loops, the follower collective driver, and sync.
    pub fn init(config: EngineConfig, backends: Backends) -> Result<Arc<Engine>> {
        config.validate()?;
        if config.distributed && config.is_root() && backends.ps.is_none() {
            return Err(EngineError::InvalidConfig(
                "distributed root requires a parameter-server client".into(),
            ));
        }

        let queues = Stage::ALL
            .iter()
            .map(|&s| Arc::new(ScheduledQueue::new(s, config.credit_bytes)))
            .collect();
        let num_servers = config.num_servers;
        let engine = Arc::new(Engine {
            config,
            backends,
            queues,
            tracker: GroupTracker::new(),
            ready: ReadyTable::new(),
            key_encoder: PsKeyEncoder::new(num_servers),
            contexts: RwLock::new(HashMap::new()),
            next_key: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let mut loop_set: Vec<(&'static str, fn(Arc<Engine>))> = Vec::new();
        if engine.is_root() {
            loop_set.push(("collective", loops::root_collective_loop));
            loop_set.push(("sync", loops::sync_loop));
            if engine.local_size() > 1 {
                loop_set.push(("listen", loops::listen_loop));
            }
            if engine.is_distributed() {
                loop_set.push(("copy-d2h", loops::copy_d2h_loop));
                loop_set.push(("push", loops::push_loop));
                loop_set.push(("pull", loops::pull_loop));
                loop_set.push(("copy-h2d", loops::copy_h2d_loop));
            }
        } else {
            loop_set.push(("coord-reduce", loops::coordinate_reduce_loop));
            loop_set.push(("collective", loops::follower_collective_loop));
            loop_set.push(("sync", loops::sync_loop));
            loop_set.push(("coord-bcast", loops::coordinate_broadcast_loop));
        }

        let mut handles = engine.threads.lock().unwrap();
        for (name, entry) in loop_set {
            let e = Arc::clone(&engine);
            let handle = std::thread::Builder::new()
                .name(format!("gradsync-{name}"))
                .spawn(move || entry(e))
                .map_err(|e| EngineError::Backend(format!("failed to spawn {name} loop: {e}")))?;
            handles.push(handle);
        }
        drop(handles);

        debug!(
            rank = engine.rank(),
            local_rank = engine.local_rank(),
            local_size = engine.local_size(),
            distributed = engine.is_distributed(),
            root = engine.is_root(),
            "engine started"
        );
        Ok(engine)
    }

    /// Raise the shutdown flag and join every loop at its next poll
    /// boundary. Owned pinned buffers are released with their contexts.
    /// Must not be called from a loop thread or a completion callback.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("a stage loop panicked before shutdown");
            }
        }
        self.contexts.write().unwrap().clear();
        debug!(rank = self.rank(), "engine shut down");
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Submission-surface health check.
    pub fn check_initialized(&self) -> Status {
        if self.should_shutdown() {
            return Err(EngineError::Shutdown);
        }
        Ok(())
    }

    // ── Topology ────────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.config.rank()
    }

    pub fn local_rank(&self) -> usize {
        self.config.local_rank
    }

    pub fn size(&self) -> usize {
        self.config.size()
    }

    pub fn local_size(&self) -> usize {
        self.config.local_size
    }

    pub fn root(&self) -> usize {
        self.config.root()
    }

    pub fn is_root(&self) -> bool {
        self.config.is_root()
    }

    pub fn is_distributed(&self) -> bool {
        self.config.distributed
    }

    // ── Shared state reached by the loops ───────────────────────────────

    pub fn queue(&self, stage: Stage) -> &ScheduledQueue {
        &self.queues[stage.index()]
    }

    pub(crate) fn tracker(&self) -> &GroupTracker {
        &self.tracker
    }

    pub(crate) fn ready_table(&self) -> &ReadyTable {
        &self.ready
    }

    pub(crate) fn comm(&self) -> &dyn HostComm {
        self.backends.comm.as_ref()
    }

    pub(crate) fn collective(&self) -> &dyn Collective {
        self.backends.collective.as_ref()
    }

    pub(crate) fn copy_engine(&self) -> &dyn CopyEngine {
        self.backends.copy.as_ref()
    }

    pub(crate) fn ps(&self) -> &dyn PsClient {
        self.backends
            .ps
            .as_deref()
            .expect("parameter-server client not configured")
    }

    pub fn encode_default_key(&self, key: u32, len: usize) -> PsKeyMap {
        self.key_encoder.encode_default_key(key, len)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Fetch or lazily create the context registered under `name`.
    pub fn get_context(&self, name: &str) -> Arc<TensorContext> {
        if let Some(ctx) = self.contexts.read().unwrap().get(name) {
            return Arc::clone(ctx);
        }
        let mut contexts = self.contexts.write().unwrap();
        Arc::clone(
            contexts
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TensorContext::new(name))),
        )
    }

    /// Whether `name` finished init with exactly this byte length.
    pub fn is_tensor_initialized(&self, name: &str, size: usize) -> bool {
        self.contexts
            .read()
            .unwrap()
            .get(name)
            .map(|ctx| ctx.is_initialized() && ctx.layout().is_some_and(|l| l.size == size))
            .unwrap_or(false)
    }

    /// Fix the partition layout for `name`, assigning one slice key per
    /// partition from the process-wide key counter.
    fn declare_tensor(&self, name: &str, size: usize) -> Result<Arc<TensorContext>> {
        if size == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "tensor {name} has zero length"
            )));
        }
        let ctx = self.get_context(name);
        let parts = size.div_ceil(self.config.partition_bytes);
        if let Some(layout) = ctx.layout() {
            if layout.key_list.len() != parts {
                return Err(EngineError::KeyCountMismatch {
                    name: name.to_string(),
                    parts,
                    keys: layout.key_list.len(),
                });
            }
            return Ok(ctx);
        }
        let base = self.next_key.fetch_add(parts as u32, Ordering::AcqRel);
        let key_list = (base..base + parts as u32).collect();
        ctx.set_layout(TensorLayout { size, key_list });
        Ok(ctx)
    }

    // ── Submission surface ──────────────────────────────────────────────

    /// Register `name`, stage its pinned buffer, seed the PS with the
    /// buffer contents (worker 0 only), and barrier the worker group.
    ///
    /// Only the host root materializes a pinned buffer; a caller-supplied
    /// `cpubuff` is borrowed rather than allocated.
    pub fn enqueue_tensor_init(
        &self,
        name: &str,
        dtype: DataType,
        size: usize,
        cpubuff: Option<Arc<PinnedBuffer>>,
        callback: StatusCallback,
    ) -> Status {
        self.check_initialized()?;
        let ctx = self.declare_tensor(name, size)?;

        if self.is_root() && ctx.buffer().is_none() {
            match cpubuff {
                Some(buf) => {
                    if buf.len() < size {
                        return Err(EngineError::InvalidConfig(format!(
                            "tensor {name}: supplied buffer of {} bytes is smaller than {size}",
                            buf.len()
                        )));
                    }
                    trace!(tensor = name, len = size, "reusing caller buffer");
                    ctx.set_buffer(buf, true);
                }
                None => {
                    trace!(tensor = name, len = size, "allocating pinned buffer");
                    ctx.set_buffer(self.backends.allocator.alloc(size)?, false);
                }
            }
        }

        let layout = ctx
            .layout()
            .cloned()
            .expect("layout latched by declare_tensor");
        trace!(
            tensor = name,
            size,
            parts = layout.key_list.len(),
            "begin tensor init"
        );

        if self.is_distributed() && self.is_root() {
            let buf = ctx.buffer().cloned().expect("root pinned buffer set above");
            let cmd = command_for(RequestKind::DefaultPushPull, dtype);
            let bound = self.config.partition_bytes;
            let mut accumulated = 0usize;
            let mut i = 0usize;
            while accumulated < size {
                let len = (size - accumulated).min(bound);
                // Only worker 0 seeds the parameter state.
                if self.config.worker_id == 0 {
                    let pskv = self.encode_default_key(layout.key_list[i], len);
                    self.ps().push_sync(
                        &pskv,
                        SliceData {
                            source: SliceSource::Pinned(Arc::clone(&buf)),
                            offset: accumulated,
                            len,
                        },
                        cmd,
                    );
                }
                self.ps().barrier();
                accumulated += len;
                i += 1;
            }
            debug_assert_eq!(i, layout.key_list.len());
        }

        ctx.mark_initialized();
        trace!(tensor = name, size, "finish tensor init");
        callback(Ok(()));
        Ok(())
    }

    /// Partition a tensor into slices and schedule them on the first stage
    /// of `stage_list`. With an empty `stage_list` the callback fires
    /// immediately (legal fast path for no-op tensors).
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_tensor(
        &self,
        name: &str,
        input: Option<Arc<dyn Tensor>>,
        output: Option<Arc<dyn Tensor>>,
        ready_event: Option<Arc<dyn ReadyEvent>>,
        device: i32,
        priority: i32,
        version: i32,
        callback: StatusCallback,
        stage_list: Vec<Stage>,
    ) -> Status {
        self.check_initialized()?;
        let ctx = self
            .contexts
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTensor(name.to_string()))?;
        if !ctx.is_initialized() {
            return Err(EngineError::TensorNotInitialized(name.to_string()));
        }

        if let (Some(a), Some(b)) = (&input, &output) {
            if a.size() != b.size() {
                return Err(EngineError::SizeMismatch {
                    name: name.to_string(),
                    input: a.size(),
                    output: b.size(),
                });
            }
        }
        let size = input
            .as_ref()
            .map(|t| t.size())
            .or_else(|| output.as_ref().map(|t| t.size()))
            .ok_or_else(|| EngineError::MissingSize(name.to_string()))?;
        let layout = ctx
            .layout()
            .cloned()
            .ok_or_else(|| EngineError::TensorNotInitialized(name.to_string()))?;

        let slices = partition_submission(
            Submission {
                name: name.to_string(),
                size,
                key_list: layout.key_list,
                tensor: input,
                output,
                ready_event,
                cpubuff: ctx.buffer().cloned(),
                device,
                priority,
                version,
                callback: Arc::clone(&callback),
                stage_list: stage_list.clone(),
            },
            self.config.partition_bytes,
        )?;

        let Some(&first) = stage_list.first() else {
            trace!(tensor = name, device, "no stages assigned, skipped");
            callback(Ok(()));
            return Ok(());
        };

        for task in slices {
            trace!(
                tensor = %task.name,
                key = task.key,
                offset = task.offset,
                len = task.len,
                device = task.device,
                rank = self.local_rank(),
                "enqueue slice"
            );
            self.queue(first).add_task(task);
        }
        trace!(tensor = name, rank = self.local_rank(), "enqueue finished");
        Ok(())
    }

    // ── Stage-list helpers for framework adapters ───────────────────────

    /// Stages of the reduce/push half for this rank's role.
    pub fn push_stage_list(&self) -> Vec<Stage> {
        if self.is_root() {
            let mut stages = Vec::new();
            if self.local_size() > 1 || !self.is_distributed() {
                stages.push(Stage::Reduce);
            }
            if self.is_distributed() {
                stages.push(Stage::CopyD2H);
                stages.push(Stage::Push);
            }
            stages
        } else {
            vec![Stage::CoordReduce, Stage::Reduce]
        }
    }

    /// Stages of the pull/broadcast half for this rank's role.
    pub fn pull_stage_list(&self) -> Vec<Stage> {
        if self.is_root() {
            let mut stages = Vec::new();
            if self.is_distributed() {
                stages.push(Stage::Pull);
                stages.push(Stage::CopyH2D);
            }
            if self.local_size() > 1 || !self.is_distributed() {
                stages.push(Stage::Broadcast);
            }
            stages
        } else {
            vec![Stage::CoordBroadcast, Stage::Broadcast]
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rank", &self.rank())
            .field("local_size", &self.local_size())
            .field("distributed", &self.is_distributed())
            .field("shutdown", &self.should_shutdown())
            .finish()
    }
}

// ── Module-level accessor ───────────────────────────────────────────────

static INSTANCE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);

/// Install `engine` as the process-wide instance used by framework
/// adapters that cannot thread an engine handle through.
pub fn install(engine: Arc<Engine>) {
    *INSTANCE.write().unwrap() = Some(engine);
}

/// Fetch the installed engine. Fails after [`Engine::shutdown`] so stale
/// adapters get an error instead of touching released state.
pub fn instance() -> Result<Arc<Engine>> {
    let guard = INSTANCE.read().unwrap();
    match guard.as_ref() {
        Some(engine) if engine.should_shutdown() => Err(EngineError::Shutdown),
        Some(engine) => Ok(Arc::clone(engine)),
        None => Err(EngineError::NotInitialized),
    }
}

/// Drop the installed instance.
pub fn uninstall() {
    *INSTANCE.write().unwrap() = None;
}
