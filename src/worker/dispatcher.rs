//! Task dispatcher and worker pool.
//!
//! `submit` never blocks: tasks go into an unbounded queue served by a fixed
//! number of named threads. Each thread owns nothing but a receiver clone; the
//! model handle travels with the job.
//!
//! Task states: Accepted (on submit) -> Running (a slot picked it up) ->
//! Succeeded | Failed (reported exactly once).

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use vision_worker_protocol::TaskOutcome;

use crate::engine::VisionModel;
use crate::error::{DispatchError, TaskError};
use crate::worker::panic_message;
use crate::worker::preprocess::ImagePreprocessor;
use crate::worker::reporter::ReporterHandle;

/// One image summarization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub image_path: PathBuf,
}

impl Task {
    pub fn new(id: impl Into<String>, image_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            image_path: image_path.into(),
        }
    }
}

struct Job {
    task: Task,
    model: Arc<dyn VisionModel>,
    accepted_at: Instant,
}

/// State shared by every pool thread.
struct Shared {
    preprocessor: ImagePreprocessor,
    prompt: String,
    reporter: ReporterHandle,
    /// task id -> number of copies currently accepted but not reported.
    in_flight: Mutex<HashMap<String, usize>>,
    completed: AtomicUsize,
}

impl Shared {
    fn track(&self, id: &str) -> usize {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        let count = in_flight.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn untrack(&self, id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = in_flight.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(id);
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .sum()
    }
}

pub struct TaskDispatcher {
    queue: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl TaskDispatcher {
    /// Start `pool_size` worker threads (at least one).
    pub fn spawn(
        pool_size: usize,
        preprocessor: ImagePreprocessor,
        prompt: impl Into<String>,
        reporter: ReporterHandle,
    ) -> std::io::Result<Self> {
        let pool_size = pool_size.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            preprocessor,
            prompt: prompt.into(),
            reporter,
            in_flight: Mutex::new(HashMap::new()),
            completed: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let rx = rx.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("vision_worker-{index}"))
                .spawn(move || worker_loop(index, rx, shared))?;
            workers.push(handle);
        }
        info!("[POOL] Started {pool_size} worker threads");

        Ok(Self {
            queue: Some(tx),
            workers,
            shared,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Accept a task. `task_accepted` is emitted before the task is queued,
    /// so it always precedes the task's `result`.
    pub fn submit(&self, task: Task, model: Arc<dyn VisionModel>) -> Result<(), DispatchError> {
        self.shared.reporter.task_accepted(&task.id);
        if self.shared.track(&task.id) > 1 {
            warn!("[POOL] Task id {} submitted while a task with that id is in flight", task.id);
        }
        debug!("[POOL] {} accepted ({})", task.id, task.image_path.display());

        let job = Job {
            task,
            model,
            accepted_at: Instant::now(),
        };
        let sent = match &self.queue {
            Some(queue) => queue.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        };

        if let Err(job) = sent {
            self.shared.untrack(&job.task.id);
            self.shared.reporter.report(
                job.task.id,
                TaskOutcome::Failed {
                    reason: DispatchError::Closed.to_string(),
                },
            );
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    /// Tasks accepted but not yet reported.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Close the queue and wait until every accepted task has reported.
    /// Returns the number of tasks completed over the pool's lifetime.
    pub fn drain(&mut self) -> usize {
        if self.queue.take().is_some() {
            info!("[POOL] Draining {} in-flight tasks", self.in_flight());
        }
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("vision_worker").to_string();
            if worker.join().is_err() {
                warn!("[POOL] {name} exited with a panic");
            }
        }
        self.shared.completed.load(Ordering::SeqCst)
    }
}

impl Drop for TaskDispatcher {
    fn drop(&mut self) {
        self.drain();
    }
}

fn worker_loop(index: usize, rx: Receiver<Job>, shared: Arc<Shared>) {
    for job in rx.iter() {
        let Job {
            task,
            model,
            accepted_at,
        } = job;

        let started = Instant::now();
        debug!(
            "[POOL] worker-{index} running {} (queued {:?})",
            task.id,
            started.duration_since(accepted_at)
        );

        let outcome = match run_task(&shared, &task, model.as_ref()) {
            Ok(summary) => {
                let elapsed = started.elapsed();
                debug!("[POOL] worker-{index} finished {} in {:?}", task.id, elapsed);
                TaskOutcome::Succeeded { summary, elapsed }
            }
            Err(e) => {
                warn!("[POOL] Task {} failed: {e}", task.id);
                TaskOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        shared.untrack(&task.id);
        shared.reporter.report(task.id, outcome);
        shared.completed.fetch_add(1, Ordering::SeqCst);
    }
    debug!("[POOL] worker-{index} exiting");
}

fn run_task(shared: &Shared, task: &Task, model: &dyn VisionModel) -> Result<String, TaskError> {
    panic::catch_unwind(AssertUnwindSafe(|| -> Result<String, TaskError> {
        let image = shared.preprocessor.prepare(&task.image_path)?;
        Ok(model.describe(&image, &shared.prompt)?)
    }))
    .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))))
}
