//! Scripted engine for tests and host-side E2E runs (`--features mock`).
//!
//! Behaviour is driven by the image file name:
//! - contains `fail`: inference returns an error
//! - contains `panic`: inference panics
//! - contains `slow`: inference sleeps for the slow delay first
//!
//! Otherwise it sleeps for the base delay and returns a short summary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{InferenceEngine, LoadRequest, VisionModel};
use crate::error::EngineError;
use crate::worker::preprocess::EncodedImage;

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicUsize,
    describes: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

#[derive(Debug)]
pub struct MockEngine {
    accelerated: bool,
    failing_loads: AtomicUsize,
    base_delay: Duration,
    slow_delay: Duration,
    counters: Arc<Counters>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            accelerated: false,
            failing_loads: AtomicUsize::new(0),
            base_delay: Duration::from_millis(5),
            slow_delay: Duration::from_millis(300),
            counters: Arc::new(Counters::default()),
        }
    }
}

impl MockEngine {
    pub fn with_acceleration(mut self, accelerated: bool) -> Self {
        self.accelerated = accelerated;
        self
    }

    /// The next `n` loads fail.
    pub fn with_failing_loads(self, n: usize) -> Self {
        self.failing_loads.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delays(mut self, base: Duration, slow: Duration) -> Self {
        self.base_delay = base;
        self.slow_delay = slow;
        self
    }

    /// Successful and failed load attempts that reached the engine.
    pub fn load_calls(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.counters.describes.load(Ordering::SeqCst)
    }

    /// Most inferences seen sleeping at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak_active.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_acceleration(&self) -> bool {
        self.accelerated
    }

    fn load(&self, request: &LoadRequest) -> Result<Arc<dyn VisionModel>, EngineError> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EngineError::Load(format!(
                "mock refused to load {}",
                request.model_path.display()
            )));
        }
        Ok(Arc::new(MockModel {
            base_delay: self.base_delay,
            slow_delay: self.slow_delay,
            counters: self.counters.clone(),
        }))
    }
}

struct MockModel {
    base_delay: Duration,
    slow_delay: Duration,
    counters: Arc<Counters>,
}

impl VisionModel for MockModel {
    fn describe(&self, image: &EncodedImage, prompt: &str) -> Result<String, EngineError> {
        self.counters.describes.fetch_add(1, Ordering::SeqCst);
        let name = image
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name.contains("panic") {
            panic!("mock engine panicked on {name}");
        }
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_active.fetch_max(active, Ordering::SeqCst);
        if name.contains("slow") {
            thread::sleep(self.slow_delay);
        } else {
            thread::sleep(self.base_delay);
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        if name.contains("fail") {
            return Err(EngineError::Inference(format!("mock failure for {name}")));
        }

        Ok(format!(
            "{name}: {}x{} image ({} bytes), prompt '{prompt}'",
            image.width,
            image.height,
            image.bytes.len()
        ))
    }
}
