//! Error types for the synchronization engine.

use thiserror::Error;

/// Errors surfaced by the submission API and backend seams.
///
/// Usage errors are returned synchronously from the submission surface.
/// Backend errors are fatal once a slice is in flight: stage loops log them
/// and abort, because the pipeline has no retry path.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine has not been initialized (or was never installed).
    #[error("engine is not initialized")]
    NotInitialized,

    /// The engine has been shut down; the accessor is no longer valid.
    #[error("engine is shut down")]
    Shutdown,

    /// A tensor was submitted before `enqueue_tensor_init` completed.
    #[error("tensor {0} is not initialized")]
    TensorNotInitialized(String),

    /// Submission named a tensor that was never registered.
    #[error("unknown tensor {0}")]
    UnknownTensor(String),

    /// Input and output tensors were both supplied with different sizes.
    #[error("tensor {name}: input size {input} does not match output size {output}")]
    SizeMismatch {
        name: String,
        input: usize,
        output: usize,
    },

    /// Neither input nor output provides a byte size.
    #[error("tensor {0}: no size source (input and output both absent)")]
    MissingSize(String),

    /// The partition count derived from the submitted size does not match
    /// the key list established at init time.
    #[error("tensor {name}: {parts} partitions for {keys} declared keys")]
    KeyCountMismatch {
        name: String,
        parts: usize,
        keys: usize,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No compressor strategy registered under this name.
    #[error("unknown compressor kind {0:?}")]
    UnknownCompressor(String),

    /// A compressor kwarg is missing or failed to parse.
    #[error("compressor option {0:?} is missing or malformed")]
    CompressorOption(String),

    /// Failure reported by a backend (collective, copy, PS, signal channel).
    #[error("backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Completion status delivered to per-tensor callbacks. The only
/// post-enqueue outcome the engine can deliver is `Ok(())`; any backend
/// failure aborts the process before a callback would run.
pub type Status = Result<()>;
