//! Vision worker process.
//!
//! Runs as a child process spawned by the host application. Reads JSON Lines
//! commands from stdin, loads the multimodal model on `init`, summarizes
//! images on a fixed thread pool and writes JSON Lines messages to stdout.
//! All diagnostics go to stderr.

use std::any::Any;

pub mod dispatcher;
pub mod model_manager;
pub mod preprocess;
pub mod reporter;
pub mod worker_main;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{Task, TaskDispatcher};
pub use model_manager::{LoadReport, ModelManager, ModelStatus};
pub use preprocess::{EncodedImage, ImagePreprocessor};
pub use reporter::{Reporter, ReporterHandle};
pub use worker_main::{run_worker, run_worker_until, WorkerExit};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
