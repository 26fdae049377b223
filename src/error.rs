//! Error types for the worker components.
//!
//! Every error here ends up as text on the wire (`errMsg`), so the `Display`
//! output is what the host sees.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while turning an image file into the engine's input encoding.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image file does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read image {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode image {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Failures reported by an inference engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The binary was built without an engine backend.
    #[error("inference engine unavailable: {0}")]
    Unavailable(String),

    #[error("failed to load model: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Failures of `init`. The lifecycle moves to `Failed` and may be retried.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model file does not exist: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("vision projector file does not exist: {}", .0.display())]
    ProjectorNotFound(PathBuf),

    #[error("no mmproj *.gguf file found next to the model in {}", .0.display())]
    NoProjector(PathBuf),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures of a single task. Always converted into a failed `result`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Failures to hand a task to the pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker pool is shut down")]
    Closed,
}
