//! Engine lifecycle, submission-surface validation, and the module-level
//! accessor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gradsync_core::comm::{HostComm, LocalHostComm};
use gradsync_core::engine;
use gradsync_core::tensor::{DataType, Tensor};
use gradsync_core::testing::{mock_backends, HostTensor};
use gradsync_core::{Engine, EngineConfig, EngineError, Stage, StatusCallback};

const MIB: usize = 1 << 20;

fn single_rank_engine(cfg: EngineConfig) -> Arc<Engine> {
    let comm: Arc<dyn HostComm> = Arc::new(LocalHostComm::hub(1).remove(0));
    let (backends, _) = mock_backends(comm, None);
    Engine::init(cfg, backends).unwrap()
}

fn counting_callback() -> (StatusCallback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let cb: StatusCallback = Arc::new(move |status| {
        status.unwrap();
        c.fetch_add(1, Ordering::AcqRel);
    });
    (cb, count)
}

#[test]
fn topology_getters_reflect_config() {
    let engine = single_rank_engine(EngineConfig::default());
    assert_eq!(engine.rank(), 0);
    assert_eq!(engine.local_rank(), 0);
    assert_eq!(engine.size(), 1);
    assert_eq!(engine.local_size(), 1);
    assert!(engine.is_root());
    assert!(!engine.is_distributed());
    assert!(engine.check_initialized().is_ok());
    engine.shutdown();
}

#[test]
fn shutdown_invalidates_submission_surface() {
    let engine = single_rank_engine(EngineConfig::default());
    engine.shutdown();
    assert!(matches!(
        engine.check_initialized(),
        Err(EngineError::Shutdown)
    ));
    let (cb, count) = counting_callback();
    let err = engine
        .enqueue_tensor_init("t", DataType::Float32, MIB, None, cb)
        .unwrap_err();
    assert!(matches!(err, EngineError::Shutdown));
    assert_eq!(count.load(Ordering::Acquire), 0);
    // Idempotent.
    engine.shutdown();
}

#[test]
fn accessor_lifecycle() {
    // The accessor is process-global, so the whole lifecycle lives in one
    // test body.
    engine::uninstall();
    assert!(matches!(
        engine::instance(),
        Err(EngineError::NotInitialized)
    ));

    let engine = single_rank_engine(EngineConfig::default());
    engine::install(Arc::clone(&engine));
    assert_eq!(engine::instance().unwrap().rank(), 0);

    engine.shutdown();
    assert!(matches!(engine::instance(), Err(EngineError::Shutdown)));

    engine::uninstall();
    assert!(matches!(
        engine::instance(),
        Err(EngineError::NotInitialized)
    ));
}

#[test]
fn init_round_trip_and_size_check() {
    let engine = single_rank_engine(EngineConfig {
        partition_bytes: MIB,
        ..Default::default()
    });
    assert!(!engine.is_tensor_initialized("t", MIB));
    let (cb, _count) = counting_callback();
    engine
        .enqueue_tensor_init("t", DataType::Float32, 3 * MIB, None, cb)
        .unwrap();
    assert!(engine.is_tensor_initialized("t", 3 * MIB));
    assert!(!engine.is_tensor_initialized("t", MIB));
    let ctx = engine.get_context("t");
    assert!(ctx.is_initialized());
    assert_eq!(ctx.layout().unwrap().key_list.len(), 3);
    engine.shutdown();
}

#[test]
fn submission_usage_errors() {
    let engine = single_rank_engine(EngineConfig {
        partition_bytes: MIB,
        ..Default::default()
    });

    let (cb, _c) = counting_callback();
    let err = engine
        .enqueue_tensor("ghost", None, None, None, 0, 0, 0, cb, vec![Stage::Reduce])
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownTensor(_)));

    // Registered but never initialized.
    engine.get_context("early");
    let (cb, _c) = counting_callback();
    let err = engine
        .enqueue_tensor("early", None, None, None, 0, 0, 0, cb, vec![Stage::Reduce])
        .unwrap_err();
    assert!(matches!(err, EngineError::TensorNotInitialized(_)));

    let (cb, _c) = counting_callback();
    engine
        .enqueue_tensor_init("t", DataType::Float32, MIB, None, cb)
        .unwrap();

    // Mismatched input/output sizes.
    let input: Arc<dyn Tensor> = Arc::new(HostTensor::zeroed(MIB, DataType::Float32));
    let output: Arc<dyn Tensor> = Arc::new(HostTensor::zeroed(MIB / 2, DataType::Float32));
    let (cb, _c) = counting_callback();
    let err = engine
        .enqueue_tensor(
            "t",
            Some(input),
            Some(output),
            None,
            0,
            0,
            0,
            cb,
            vec![Stage::Reduce],
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::SizeMismatch { .. }));

    // No size source at all.
    let (cb, _c) = counting_callback();
    let err = engine
        .enqueue_tensor("t", None, None, None, 0, 0, 0, cb, vec![Stage::Reduce])
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingSize(_)));

    // Size inconsistent with the declared key list.
    let wrong: Arc<dyn Tensor> = Arc::new(HostTensor::zeroed(3 * MIB, DataType::Float32));
    let (cb, _c) = counting_callback();
    let err = engine
        .enqueue_tensor(
            "t",
            Some(wrong),
            None,
            None,
            0,
            0,
            0,
            cb,
            vec![Stage::Reduce],
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::KeyCountMismatch { .. }));

    engine.shutdown();
}

#[test]
fn empty_stage_list_fires_callback_immediately() {
    let engine = single_rank_engine(EngineConfig {
        partition_bytes: MIB,
        ..Default::default()
    });
    let (cb, _c) = counting_callback();
    engine
        .enqueue_tensor_init("t", DataType::Float32, MIB, None, cb)
        .unwrap();

    let input: Arc<dyn Tensor> = Arc::new(HostTensor::zeroed(MIB, DataType::Float32));
    let (cb, count) = counting_callback();
    engine
        .enqueue_tensor("t", Some(input), None, None, 0, 0, 0, cb, Vec::new())
        .unwrap();
    assert_eq!(count.load(Ordering::Acquire), 1);
    for stage in Stage::ALL {
        assert!(engine.queue(stage).is_empty());
    }
    engine.shutdown();
}

#[test]
fn stage_lists_per_role() {
    // Root, non-distributed.
    let engine = single_rank_engine(EngineConfig::default());
    assert_eq!(engine.push_stage_list(), vec![Stage::Reduce]);
    assert_eq!(engine.pull_stage_list(), vec![Stage::Broadcast]);
    engine.shutdown();

    // Root, distributed, single local rank: pure PS pipeline.
    let ps = Arc::new(gradsync_core::testing::MockPsClient::new());
    let comm: Arc<dyn HostComm> = Arc::new(LocalHostComm::hub(1).remove(0));
    let (backends, _) = mock_backends(comm, Some(ps));
    let engine = Engine::init(
        EngineConfig {
            distributed: true,
            ..Default::default()
        },
        backends,
    )
    .unwrap();
    assert_eq!(engine.push_stage_list(), vec![Stage::CopyD2H, Stage::Push]);
    assert_eq!(engine.pull_stage_list(), vec![Stage::Pull, Stage::CopyH2D]);
    engine.shutdown();

    // Follower: coordinate stages bracket the collective ones.
    let mut hub = LocalHostComm::hub(2);
    let follower_comm: Arc<dyn HostComm> = Arc::new(hub.remove(1));
    let root_comm: Arc<dyn HostComm> = Arc::new(hub.remove(0));
    let (backends, _) = mock_backends(follower_comm, None);
    let follower = Engine::init(
        EngineConfig {
            local_size: 2,
            local_rank: 1,
            ..Default::default()
        },
        backends,
    )
    .unwrap();
    assert_eq!(
        follower.push_stage_list(),
        vec![Stage::CoordReduce, Stage::Reduce]
    );
    assert_eq!(
        follower.pull_stage_list(),
        vec![Stage::CoordBroadcast, Stage::Broadcast]
    );
    follower.shutdown();
    drop(root_comm);
}

#[test]
fn distributed_root_requires_ps_client() {
    let comm: Arc<dyn HostComm> = Arc::new(LocalHostComm::hub(1).remove(0));
    let (backends, _) = mock_backends(comm, None);
    let err = Engine::init(
        EngineConfig {
            distributed: true,
            ..Default::default()
        },
        backends,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}
