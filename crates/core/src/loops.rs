//! Stage loops: the worker threads that drain the scheduled queues and
//! advance slices through the pipeline.
//!
//! Every loop polls its queue and sleeps ~1 us when idle; all of them exit
//! at the next poll boundary once the engine's shutdown flag is raised.
//! Backend failures are fatal here: the pipeline has no retry, so a failed
//! collective, copy, or PS call logs and aborts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use crate::collective::{Collective, CollectiveEvent, CopyEngine, GroupEntry};
use crate::comm::{HostComm, Signal, SignalMessage};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::ps::{command_for, PsClient, RequestKind, SliceData, SliceSource};
use crate::task::{SliceTask, Stage};
use crate::tensor::{ReadyEvent, Tensor};

/// Sleep applied by every loop when its queue has nothing eligible.
const IDLE_SLEEP: Duration = Duration::from_micros(1);

/// Poll granularity for blocking signal receives; bounds shutdown latency.
const RECV_POLL: Duration = Duration::from_millis(1);

fn idle() {
    std::thread::sleep(IDLE_SLEEP);
}

fn backend_fatal(stage: &str, err: EngineError) -> ! {
    error!(stage, %err, "backend failure, aborting");
    panic!("{stage}: {err}");
}

/// Block until the framework marks the task's upstream compute complete.
/// Returns false when shutdown was raised while waiting; the caller drops
/// the task and exits at its poll boundary.
fn wait_ready(engine: &Engine, task: &SliceTask) -> bool {
    if let Some(ev) = &task.ready_event {
        while !ev.ready() {
            if engine.should_shutdown() {
                return false;
            }
            idle();
        }
    }
    true
}

/// The single advancement primitive.
///
/// Pops the task's current stage; if stages remain the task is handed to
/// the next stage's queue, otherwise the completion counter advances and
/// the observer of the final increment fires the callback.
pub(crate) fn finish_or_proceed(engine: &Engine, task: Arc<SliceTask>) {
    let this_op = task
        .pop_stage()
        .expect("task advanced past its final stage");
    if let Some(next) = task.current_stage() {
        trace!(
            rank = engine.rank(),
            stage = this_op.name(),
            next = next.name(),
            tensor = %task.name,
            key = task.key,
            "passing task to next queue"
        );
        engine.queue(next).add_task(task);
    } else {
        let v = task.counter.advance();
        if v == task.total_partnum - 1 {
            trace!(rank = engine.rank(), tensor = %task.name, "tensor complete");
            (task.callback)(Ok(()));
        }
    }
}

/// Follower announcement stage (`CoordReduce` / `CoordBroadcast`).
///
/// The task is advanced *before* the READY signal goes out so that the
/// root-driven `DoReduce`/`DoBroadcast` lookup by key always finds it.
fn run_coordinate_once(engine: &Engine, this_op: Stage) {
    let q = engine.queue(this_op);
    let Some(task) = q.get_task() else {
        idle();
        return;
    };
    assert!(
        !engine.is_root(),
        "only follower ranks run the {} loop",
        this_op.name()
    );

    let key = task.key;
    let len = task.len as u64;
    finish_or_proceed(engine, task);

    let signal = match this_op {
        Stage::CoordReduce => Signal::ReduceReady,
        Stage::CoordBroadcast => Signal::BcastReady,
        other => unreachable!("{} is not a coordinate stage", other.name()),
    };
    let msg = SignalMessage {
        src: engine.local_rank() as i32,
        signal,
        key: key as i32,
    };
    if let Err(e) = engine.comm().send_signal(engine.root(), msg) {
        backend_fatal(this_op.name(), e);
    }
    trace!(
        rank = engine.local_rank(),
        stage = this_op.name(),
        key,
        "announced readiness to root"
    );

    q.report_finish(len);
}

/// Root-side collective driver: forms one group per pass, draining up to
/// `group_size` tasks per op in the fixed `[Reduce, Broadcast]` order.
///
/// With `local_size == 1` the collective call and all `Do*` signals are
/// skipped but tasks still advance; for single-GPU non-distributed jobs
/// the data is already in its final location, so this is sound.
fn run_root_collective_once(engine: &Engine) {
    let collective = engine.collective();
    let root = engine.root();
    let rank = engine.local_rank();
    debug_assert_eq!(rank, root, "only the root rank drives collectives");
    // Every follower must have announced a key before it is drained.
    let need = engine.local_size() - 1;

    let mut tasks: Vec<Arc<SliceTask>> = Vec::new();
    let mut queues: Vec<Stage> = Vec::new();

    collective.group_start();
    for this_op in [Stage::Reduce, Stage::Broadcast] {
        let q = engine.queue(this_op);
        for _ in 0..engine.config().group_size {
            let task = if need > 0 {
                q.get_task_where(|t| engine.ready_table().is_ready(this_op, t.key, need))
            } else {
                q.get_task()
            };
            let Some(task) = task else { break };
            if need > 0 {
                engine.ready_table().consume(this_op, task.key, need);
            }
            if !wait_ready(engine, &task) {
                break;
            }

            let tensor = match this_op {
                Stage::Reduce => task.tensor.clone(),
                _ => task.output.clone(),
            }
            .unwrap_or_else(|| panic!("{}: task {} has no tensor", this_op.name(), task.name));

            if task.is_gpu() && engine.local_size() > 1 {
                let msg = SignalMessage {
                    src: rank as i32,
                    signal: if this_op == Stage::Reduce {
                        Signal::DoReduce
                    } else {
                        Signal::DoBroadcast
                    },
                    key: task.key as i32,
                };
                if let Err(e) = engine.comm().broadcast_signal(msg) {
                    backend_fatal(this_op.name(), e);
                }
                trace!(
                    tensor = %task.name,
                    stage = this_op.name(),
                    rank,
                    key = task.key,
                    len = task.len,
                    "issuing collective call"
                );
                let res = match this_op {
                    Stage::Reduce => collective.reduce(tensor.as_ref(), task.offset, task.len, root),
                    _ => collective.broadcast(tensor.as_ref(), task.offset, task.len, root),
                };
                if let Err(e) = res {
                    backend_fatal(this_op.name(), e);
                }
            }

            tasks.push(task);
            queues.push(this_op);
        }
    }

    if !tasks.is_empty() {
        if engine.local_size() > 1 {
            let msg = SignalMessage {
                src: rank as i32,
                signal: Signal::DoGroup,
                key: 0,
            };
            if let Err(e) = engine.comm().broadcast_signal(msg) {
                backend_fatal("collective", e);
            }
        }
        trace!(group = tasks.len(), rank, "collective group submitted");
        if let Err(e) = collective.group_end() {
            backend_fatal("collective", e);
        }
        let event = match collective.record_event() {
            Ok(ev) => ev,
            Err(e) => backend_fatal("collective", e),
        };
        engine.tracker().enqueue(GroupEntry {
            tasks,
            queues,
            event,
        });
    } else {
        if let Err(e) = collective.group_end() {
            backend_fatal("collective", e);
        }
        idle();
    }
}

/// Follower-side collective driver: opens a group, then executes the
/// root's `DoReduce`/`DoBroadcast` instructions until `DoGroup` closes it.
///
/// Returns `false` when shutdown interrupted the wait (the open group is
/// closed empty before returning).
fn run_follower_collective_once(engine: &Engine) -> bool {
    let collective = engine.collective();
    let root = engine.root();
    let rank = engine.local_rank();
    debug_assert_ne!(rank, root, "the root rank must not run the follower loop");

    let mut tasks: Vec<Arc<SliceTask>> = Vec::new();

    collective.group_start();
    loop {
        let msg = loop {
            match engine.comm().recv_signal(RECV_POLL) {
                Some(m) => break m,
                None => {
                    if engine.should_shutdown() {
                        let _ = collective.group_end();
                        return false;
                    }
                }
            }
        };
        assert_eq!(
            msg.src as usize, root,
            "follower received a signal from non-root rank {}",
            msg.src
        );
        if msg.signal == Signal::DoGroup {
            break;
        }
        let this_op = match msg.signal {
            Signal::DoReduce => Stage::Reduce,
            Signal::DoBroadcast => Stage::Broadcast,
            other => panic!("unexpected signal {other:?} in follower collective loop"),
        };
        let key = msg.key as u32;
        trace!(rank, stage = this_op.name(), key, "executing root instruction");

        let task = engine.queue(this_op).get_task_by_key(key);
        // Broadcast is the final intra-host stage; extending the pipeline
        // past it requires relaxing this check.
        assert_eq!(
            task.remaining_stages(),
            1,
            "key {key}: {} must be the slice's last stage on rank {rank}",
            this_op.name()
        );

        if task.is_gpu() {
            let tensor = match this_op {
                Stage::Reduce => task.tensor.clone(),
                _ => task.output.clone(),
            }
            .unwrap_or_else(|| panic!("{}: task {} has no tensor", this_op.name(), task.name));
            let res = match this_op {
                Stage::Reduce => collective.reduce(tensor.as_ref(), task.offset, task.len, root),
                _ => collective.broadcast(tensor.as_ref(), task.offset, task.len, root),
            };
            if let Err(e) = res {
                backend_fatal(this_op.name(), e);
            }
        }

        tasks.push(task);
    }

    if let Err(e) = collective.group_end() {
        backend_fatal("collective", e);
    }
    let event = match collective.record_event() {
        Ok(ev) => ev,
        Err(e) => backend_fatal("collective", e),
    };
    engine.tracker().enqueue(GroupEntry {
        tasks,
        queues: Vec::new(),
        event,
    });
    true
}

/// Synchronization loop: blocks on the oldest group's event, then advances
/// every task the group contained. FIFO draining is what orders task
/// advancement across groups.
fn run_sync_once(engine: &Engine) {
    let Some(entry) = engine.tracker().dequeue() else {
        idle();
        return;
    };
    if let Err(e) = entry.event.synchronize() {
        backend_fatal("sync", e);
    }
    let GroupEntry {
        tasks,
        queues,
        event,
    } = entry;
    trace!(
        group = tasks.len(),
        rank = engine.local_rank(),
        "collective group finished"
    );
    for (i, task) in tasks.into_iter().enumerate() {
        let len = task.len as u64;
        let source = queues.get(i).copied();
        finish_or_proceed(engine, task);
        if let Some(stage) = source {
            engine.queue(stage).report_finish(len);
        }
    }
    // Destroy the event only after every contained task has advanced.
    drop(event);
}

/// Device-to-host staging copy (root only).
fn run_copy_d2h_once(engine: &Engine) {
    let q = engine.queue(Stage::CopyD2H);
    let Some(task) = q.get_task() else {
        idle();
        return;
    };
    assert!(engine.is_root(), "only the root rank runs the copy_d2h loop");
    let tensor = task
        .tensor
        .clone()
        .unwrap_or_else(|| panic!("copy_d2h: task {} has no input tensor", task.name));

    if task.is_gpu() {
        if !wait_ready(engine, &task) {
            return;
        }
        let buf = task
            .cpubuff
            .clone()
            .unwrap_or_else(|| panic!("{}: pinned buffer not initialized", task.name));
        if let Err(e) = engine
            .copy_engine()
            .copy_d2h(tensor.as_ref(), task.offset, task.len, buf.as_ref())
        {
            backend_fatal("copy_d2h", e);
        }
    }

    let len = task.len as u64;
    finish_or_proceed(engine, task);
    q.report_finish(len);
}

/// Host-to-device completion copy (root only).
fn run_copy_h2d_once(engine: &Engine) {
    let q = engine.queue(Stage::CopyH2D);
    let Some(task) = q.get_task() else {
        idle();
        return;
    };
    assert!(engine.is_root(), "only the root rank runs the copy_h2d loop");
    let output = task
        .output
        .clone()
        .unwrap_or_else(|| panic!("copy_h2d: task {} has no output tensor", task.name));

    if task.is_gpu() {
        let buf = task
            .cpubuff
            .clone()
            .unwrap_or_else(|| panic!("{}: pinned buffer not initialized", task.name));
        if let Err(e) = engine
            .copy_engine()
            .copy_h2d(buf.as_ref(), task.offset, task.len, output.as_ref())
        {
            backend_fatal("copy_h2d", e);
        }
    }

    let len = task.len as u64;
    finish_or_proceed(engine, task);
    q.report_finish(len);
}

/// Asynchronous PS push (root only). Advancement happens in the PS
/// client's completion, which retains the task and its queue.
fn run_push_once(engine: &Arc<Engine>) {
    let q = engine.queue(Stage::Push);
    let Some(task) = q.get_task() else {
        idle();
        return;
    };
    assert!(engine.is_root(), "only the root rank runs the push loop");

    let source = if task.is_gpu() {
        SliceSource::Pinned(
            task.cpubuff
                .clone()
                .unwrap_or_else(|| panic!("{}: pinned buffer not initialized", task.name)),
        )
    } else {
        SliceSource::Tensor(
            task.tensor
                .clone()
                .unwrap_or_else(|| panic!("push: task {} has no input tensor", task.name)),
        )
    };
    let data = SliceData {
        source,
        offset: task.offset,
        len: task.len,
    };
    let dtype = task
        .tensor
        .as_ref()
        .unwrap_or_else(|| panic!("push: task {} has no input tensor", task.name))
        .dtype();
    let cmd = command_for(RequestKind::DefaultPushPull, dtype);
    let pskv = engine.encode_default_key(task.key, task.len);

    let eng = Arc::clone(engine);
    engine.ps().push(
        &pskv,
        data,
        cmd,
        Box::new(move || {
            let len = task.len as u64;
            finish_or_proceed(&eng, task);
            eng.queue(Stage::Push).report_finish(len);
        }),
    );
}

/// Asynchronous PS pull (root only). The pulled bytes land in the pinned
/// buffer (GPU tasks) or directly in the output tensor (CPU tasks); the
/// transfer buffer is released when the completion closure drops its
/// `SliceData`.
fn run_pull_once(engine: &Arc<Engine>) {
    let q = engine.queue(Stage::Pull);
    let Some(task) = q.get_task() else {
        idle();
        return;
    };
    assert!(engine.is_root(), "only the root rank runs the pull loop");

    let source = if task.is_gpu() {
        SliceSource::Pinned(
            task.cpubuff
                .clone()
                .unwrap_or_else(|| panic!("{}: pinned buffer not initialized", task.name)),
        )
    } else {
        SliceSource::Tensor(
            task.output
                .clone()
                .unwrap_or_else(|| panic!("pull: task {} has no output tensor", task.name)),
        )
    };
    let data = SliceData {
        source,
        offset: task.offset,
        len: task.len,
    };
    let dtype = task
        .output
        .as_ref()
        .unwrap_or_else(|| panic!("pull: task {} has no output tensor", task.name))
        .dtype();
    let cmd = command_for(RequestKind::DefaultPushPull, dtype);
    let pskv = engine.encode_default_key(task.key, task.len);

    let eng = Arc::clone(engine);
    engine.ps().pull(
        &pskv,
        data,
        cmd,
        Box::new(move || {
            let len = task.len as u64;
            finish_or_proceed(&eng, task);
            eng.queue(Stage::Pull).report_finish(len);
        }),
    );
}

/// Root-side listener translating follower READY announcements into the
/// ready table consulted by the collective driver.
fn run_listen_once(engine: &Engine) {
    let Some(msg) = engine.comm().recv_signal(RECV_POLL) else {
        return;
    };
    match msg.signal {
        Signal::ReduceReady => engine.ready_table().notify(Stage::Reduce, msg.key as u32),
        Signal::BcastReady => engine.ready_table().notify(Stage::Broadcast, msg.key as u32),
        other => panic!("root listen loop received {other:?} from rank {}", msg.src),
    }
}

// Thread entry points. Each checks the shutdown flag between iterations;
// the per-iteration bodies never block longer than a poll interval.

pub(crate) fn coordinate_reduce_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_coordinate_once(&engine, Stage::CoordReduce);
    }
}

pub(crate) fn coordinate_broadcast_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_coordinate_once(&engine, Stage::CoordBroadcast);
    }
}

pub(crate) fn root_collective_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_root_collective_once(&engine);
    }
}

pub(crate) fn follower_collective_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        if !run_follower_collective_once(&engine) {
            break;
        }
    }
}

pub(crate) fn sync_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_sync_once(&engine);
    }
}

pub(crate) fn copy_d2h_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_copy_d2h_once(&engine);
    }
}

pub(crate) fn copy_h2d_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_copy_h2d_once(&engine);
    }
}

pub(crate) fn push_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_push_once(&engine);
    }
}

pub(crate) fn pull_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_pull_once(&engine);
    }
}

pub(crate) fn listen_loop(engine: Arc<Engine>) {
    while !engine.should_shutdown() {
        run_listen_once(&engine);
    }
}
