//! Worker command loop.
//!
//! Reads JSON Lines commands from the host and drives the model manager and
//! the task pool. Every outbound line goes through the reporter's writer
//! thread; diagnostics go to the `log` facade (stderr).
//!
//! Thread design:
//! - caller thread: handles commands and interrupts, runs `init` synchronously
//! - `vision_stdin`: reads raw lines from the input
//! - `vision_worker-N`: pool threads running preprocessing + inference
//! - `vision_reporter`: owns the output stream, writes one line per message

use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{select, Receiver};
use log::{debug, error, info, warn};
use serde_json::Value;
use vision_worker_protocol::Command;

use crate::config::WorkerConfig;
use crate::engine::InferenceEngine;
use crate::worker::dispatcher::{Task, TaskDispatcher};
use crate::worker::model_manager::{ModelManager, ModelStatus};
use crate::worker::panic_message;
use crate::worker::preprocess::ImagePreprocessor;
use crate::worker::reporter::{Reporter, ReporterHandle};

/// Why the command loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A `shutdown` command was received.
    Shutdown,
    /// The host closed stdin.
    InputClosed,
    /// Reading stdin failed.
    ReadFailed,
    /// An interrupt (SIGINT) arrived.
    Interrupted,
}

impl WorkerExit {
    pub fn exit_code(self) -> i32 {
        match self {
            WorkerExit::Shutdown | WorkerExit::InputClosed => 0,
            WorkerExit::ReadFailed => 1,
            WorkerExit::Interrupted => 130,
        }
    }
}

enum Input {
    Line(Vec<u8>),
    Closed,
    Failed(io::Error),
}

enum Flow {
    Continue,
    Stop,
}

/// Run the worker until `shutdown`, end of input or a read error.
///
/// The pool is always drained before the final `log` line, and the output
/// writer is flushed and joined before this returns.
pub fn run_worker<R, W>(
    input: R,
    output: W,
    engine: Arc<dyn InferenceEngine>,
    config: WorkerConfig,
) -> io::Result<WorkerExit>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    run_worker_until(input, output, engine, config, crossbeam_channel::never())
}

/// Like [`run_worker`], but also stops when a message arrives on `interrupts`.
/// An interrupt is handled like `shutdown`: in-flight tasks still finish and
/// report before the final `log` line.
///
/// The input is read on its own thread. On `shutdown` or an interrupt that
/// thread is left blocked on the input and goes away with the process.
pub fn run_worker_until<R, W>(
    input: R,
    output: W,
    engine: Arc<dyn InferenceEngine>,
    config: WorkerConfig,
    interrupts: Receiver<()>,
) -> io::Result<WorkerExit>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let (reporter, writer) = Reporter::spawn(output)?;
    let models = ModelManager::new(
        engine.clone(),
        config.engine.clone(),
        config.generation.clone(),
        reporter.clone(),
    );
    let dispatcher = TaskDispatcher::spawn(
        config.pool_size,
        ImagePreprocessor::new(config.preprocess.clone()),
        config.generation.prompt.clone(),
        reporter.clone(),
    )?;

    info!(
        "[WORKER] Starting vision worker (pid={}, engine={}, pool={})",
        std::process::id(),
        engine.name(),
        dispatcher.pool_size()
    );
    let lines = spawn_reader(input)?;
    reporter.log("Vision worker started, waiting for init");

    let mut channel = CommandChannel {
        models,
        dispatcher,
        reporter,
    };
    let exit = channel.read_loop(lines, interrupts);

    let completed = channel.dispatcher.drain();
    let farewell = match exit {
        WorkerExit::Shutdown => format!("Shutdown complete ({completed} tasks processed)"),
        WorkerExit::InputClosed => format!("Input closed, exiting ({completed} tasks processed)"),
        WorkerExit::ReadFailed => format!("Input unreadable, exiting ({completed} tasks processed)"),
        WorkerExit::Interrupted => format!("Interrupted, exiting ({completed} tasks processed)"),
    };
    info!("[WORKER] {farewell}");
    channel.reporter.log(farewell);
    drop(channel);

    match writer.finish() {
        Ok(lines) => debug!("[WORKER] Wrote {lines} output lines"),
        Err(e) => warn!("[WORKER] Output stream failed: {e}"),
    }
    Ok(exit)
}

/// Forward input lines until end of input or a read error.
fn spawn_reader<R: BufRead + Send + 'static>(mut input: R) -> io::Result<Receiver<Input>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("vision_stdin".to_string())
        .spawn(move || loop {
            let mut buf = Vec::new();
            let event = match input.read_until(b'\n', &mut buf) {
                Ok(0) => Input::Closed,
                Ok(_) => Input::Line(buf),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Input::Failed(e),
            };
            let last = !matches!(event, Input::Line(_));
            if tx.send(event).is_err() || last {
                break;
            }
        })?;
    Ok(rx)
}

struct CommandChannel {
    models: ModelManager,
    dispatcher: TaskDispatcher,
    reporter: ReporterHandle,
}

impl CommandChannel {
    fn read_loop(&mut self, lines: Receiver<Input>, mut interrupts: Receiver<()>) -> WorkerExit {
        loop {
            let buf = select! {
                recv(lines) -> event => match event {
                    Ok(Input::Line(buf)) => Some(buf),
                    Ok(Input::Closed) | Err(_) => {
                        info!("[WORKER] Stdin closed");
                        return WorkerExit::InputClosed;
                    }
                    Ok(Input::Failed(e)) => {
                        error!("[WORKER] Failed to read stdin: {e}");
                        self.reporter.error(format!("failed to read command: {e}"));
                        return WorkerExit::ReadFailed;
                    }
                },
                recv(interrupts) -> signal => {
                    if signal.is_ok() {
                        info!(
                            "[WORKER] Interrupted, {} tasks in flight",
                            self.dispatcher.in_flight()
                        );
                        return WorkerExit::Interrupted;
                    }
                    None
                },
            };
            let Some(buf) = buf else {
                // The interrupt source is gone; keep serving input.
                interrupts = crossbeam_channel::never();
                continue;
            };

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!("[WORKER] Dropping non UTF-8 command line");
                    self.reporter.error(format!("command is not valid UTF-8: {e}"));
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            let command = match parse_command(line) {
                Ok(command) => command,
                Err(msg) => {
                    warn!("[WORKER] Failed to parse command: {msg}");
                    self.reporter.error(msg);
                    continue;
                }
            };

            let kind = command.kind();
            match panic::catch_unwind(AssertUnwindSafe(|| self.handle(command))) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return WorkerExit::Shutdown,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    error!("[WORKER] Panic while handling {kind}: {msg}");
                    self.reporter.error(format!("internal error while handling {kind}: {msg}"));
                }
            }
        }
    }

    fn handle(&self, command: Command) -> Flow {
        match command {
            Command::Init {
                model_path,
                mmproj_path,
            } => {
                let start = Instant::now();
                info!("[WORKER] init: {model_path}");
                match self
                    .models
                    .load(Path::new(&model_path), mmproj_path.as_deref().map(Path::new))
                {
                    Ok(report) => {
                        if !report.already_loaded {
                            self.reporter.log(format!(
                                "Model loaded in {:.2}s",
                                report.elapsed.as_secs_f64()
                            ));
                        }
                        self.reporter.init_succeeded(report.elapsed);
                    }
                    Err(e) => self.reporter.init_failed(start.elapsed(), e.to_string()),
                }
                Flow::Continue
            }

            Command::Process {
                image_path,
                task_id,
            } => {
                match self.models.ready_model() {
                    Some(model) => {
                        if let Err(e) = self.dispatcher.submit(Task::new(task_id, image_path), model) {
                            warn!("[WORKER] Task rejected by pool: {e}");
                        }
                    }
                    None => {
                        let msg = match (self.models.status(), self.models.last_error()) {
                            (ModelStatus::Failed, Some(reason)) => {
                                format!("model not initialized (last init failed: {reason}), task {task_id} rejected")
                            }
                            (ModelStatus::Loading, _) => {
                                format!("model not initialized (still loading), task {task_id} rejected")
                            }
                            _ => format!("model not initialized, task {task_id} rejected"),
                        };
                        warn!("[WORKER] {msg}");
                        self.reporter.error(msg);
                    }
                }
                Flow::Continue
            }

            Command::Shutdown => {
                info!(
                    "[WORKER] Shutdown requested, {} tasks in flight",
                    self.dispatcher.in_flight()
                );
                Flow::Stop
            }
        }
    }
}

/// Parse one line, telling malformed JSON, unknown types and bad fields apart.
fn parse_command(line: &str) -> Result<Command, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => return Err(format!("command type must be a string, got {other}")),
        None => return Err("command is missing a type".to_string()),
    };
    serde_json::from_value(value).map_err(|e| match kind.as_str() {
        "init" | "process" | "shutdown" => format!("invalid {kind} command: {e}"),
        _ => format!("unknown command type: {kind}"),
    })
}
