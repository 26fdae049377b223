//! Out-of-process multimodal inference worker.
//!
//! The host spawns the `vision-worker` binary, sends `init`/`process`/
//! `shutdown` commands as JSON Lines on stdin and reads `log`,
//! `init_result`, `task_accepted`, `result` and `error` lines from stdout.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod worker;

pub use vision_worker_protocol as protocol;
