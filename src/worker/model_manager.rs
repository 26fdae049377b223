//! Model lifecycle: `Uninitialized -> Loading -> Ready | Failed`.
//!
//! The manager is owned by the command loop. Only one load ever succeeds per
//! process; after that `init` is a no-op. A failed load can be retried.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{self, EngineSettings, GenerationSettings};
use crate::engine::{ExecutionMode, InferenceEngine, LoadRequest, RuntimeTuning, VisionModel};
use crate::error::{EngineError, LoadError};
use crate::worker::panic_message;
use crate::worker::reporter::ReporterHandle;

/// A successfully loaded model and what it was loaded from.
#[derive(Clone)]
pub struct LoadedModel {
    pub model_path: PathBuf,
    pub mmproj_path: PathBuf,
    pub tuning: RuntimeTuning,
    pub handle: Arc<dyn VisionModel>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_path", &self.model_path)
            .field("mmproj_path", &self.mmproj_path)
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ModelState {
    Uninitialized,
    Loading { model_path: PathBuf },
    Ready(LoadedModel),
    Failed(String),
}

/// Lifecycle state without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadReport {
    pub elapsed: Duration,
    /// The model was already loaded (or loading); nothing was done.
    pub already_loaded: bool,
}

pub struct ModelManager {
    engine: Arc<dyn InferenceEngine>,
    settings: EngineSettings,
    generation: GenerationSettings,
    reporter: ReporterHandle,
    state: Mutex<ModelState>,
}

impl ModelManager {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        settings: EngineSettings,
        generation: GenerationSettings,
        reporter: ReporterHandle,
    ) -> Self {
        Self {
            engine,
            settings,
            generation,
            reporter,
            state: Mutex::new(ModelState::Uninitialized),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ModelStatus {
        match &*self.lock() {
            ModelState::Uninitialized => ModelStatus::Uninitialized,
            ModelState::Loading { .. } => ModelStatus::Loading,
            ModelState::Ready(_) => ModelStatus::Ready,
            ModelState::Failed(_) => ModelStatus::Failed,
        }
    }

    /// Reason of the last failed load, if the manager is in `Failed`.
    pub fn last_error(&self) -> Option<String> {
        match &*self.lock() {
            ModelState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Handle to share with the pool, only once `Ready`.
    pub fn ready_model(&self) -> Option<Arc<dyn VisionModel>> {
        match &*self.lock() {
            ModelState::Ready(loaded) => Some(loaded.handle.clone()),
            _ => None,
        }
    }

    /// Load the model and projector. Idempotent once `Ready` or `Loading`.
    pub fn load(&self, model_path: &Path, mmproj_path: Option<&Path>) -> Result<LoadReport, LoadError> {
        let start = Instant::now();
        {
            let mut state = self.lock();
            match &*state {
                ModelState::Ready(loaded) => {
                    if loaded.model_path != model_path
                        || mmproj_path.is_some_and(|p| p != loaded.mmproj_path)
                    {
                        warn!(
                            "[MODEL] init for {} ignored, {} is already loaded",
                            model_path.display(),
                            loaded.model_path.display()
                        );
                    }
                    return Ok(LoadReport {
                        elapsed: start.elapsed(),
                        already_loaded: true,
                    });
                }
                ModelState::Loading { model_path: loading } => {
                    info!("[MODEL] init ignored, {} is still loading", loading.display());
                    return Ok(LoadReport {
                        elapsed: start.elapsed(),
                        already_loaded: true,
                    });
                }
                ModelState::Uninitialized | ModelState::Failed(_) => {}
            }
            *state = ModelState::Loading {
                model_path: model_path.to_path_buf(),
            };
        }

        // The lock is released while the engine works so status queries stay cheap.
        let outcome = self.load_inner(model_path, mmproj_path);

        let mut state = self.lock();
        match outcome {
            Ok(loaded) => {
                let elapsed = start.elapsed();
                info!(
                    "[MODEL] Ready in {:.2}s ({} + {})",
                    elapsed.as_secs_f64(),
                    loaded.model_path.display(),
                    loaded.mmproj_path.display()
                );
                *state = ModelState::Ready(loaded);
                Ok(LoadReport {
                    elapsed,
                    already_loaded: false,
                })
            }
            Err(e) => {
                warn!("[MODEL] Load failed: {e}");
                *state = ModelState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn load_inner(&self, model_path: &Path, mmproj_path: Option<&Path>) -> Result<LoadedModel, LoadError> {
        if !model_path.is_file() {
            return Err(LoadError::ModelNotFound(model_path.to_path_buf()));
        }
        let mmproj_path = resolve_projector(model_path, mmproj_path)?;

        let execution = if self.engine.supports_acceleration() {
            ExecutionMode::Accelerated
        } else {
            ExecutionMode::CpuFallback
        };
        let tuning = RuntimeTuning::derive(&self.settings, execution, config::logical_cpus());
        self.reporter.log(match execution {
            ExecutionMode::Accelerated => format!(
                "GPU acceleration available, offloading {} layers ({} threads)",
                tuning.gpu_layers, tuning.n_threads
            ),
            ExecutionMode::CpuFallback => format!(
                "GPU acceleration unavailable, falling back to CPU ({} threads)",
                tuning.n_threads
            ),
        });
        info!(
            "[MODEL] Loading with {} engine, {} mode, model={}, mmproj={}",
            self.engine.name(),
            execution,
            model_path.display(),
            mmproj_path.display()
        );

        let request = LoadRequest {
            model_path: model_path.to_path_buf(),
            mmproj_path,
            tuning,
            generation: self.generation.clone(),
        };
        // A panicking engine must not leave the state stuck in `Loading`.
        let handle = panic::catch_unwind(AssertUnwindSafe(|| self.engine.load(&request)))
            .map_err(|payload| {
                EngineError::Load(format!("engine panicked: {}", panic_message(payload.as_ref())))
            })??;
        Ok(LoadedModel {
            model_path: request.model_path,
            mmproj_path: request.mmproj_path,
            tuning: request.tuning,
            handle,
        })
    }
}

/// Use the given projector, or find one next to the model.
fn resolve_projector(model_path: &Path, mmproj_path: Option<&Path>) -> Result<PathBuf, LoadError> {
    if let Some(path) = mmproj_path {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(LoadError::ProjectorNotFound(path.to_path_buf()))
        };
    }

    let dir = match model_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut candidates: Vec<PathBuf> = fs::read_dir(&dir)
        .map_err(|_| LoadError::NoProjector(dir.clone()))?
        .filter_map(|entry| entry.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().is_some_and(|e| e.eq_ignore_ascii_case("gguf"))
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_ascii_lowercase().contains("mmproj"))
        })
        .collect();
    candidates.sort();

    match candidates.into_iter().next() {
        Some(found) => {
            info!("[MODEL] Found mmproj file: {}", found.display());
            Ok(found)
        }
        None => Err(LoadError::NoProjector(dir)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::worker::reporter::Reporter;
    use crate::worker::testing::SharedBuffer;
    use tempfile::TempDir;
    use vision_worker_protocol::OutputMessage;

    struct Fixture {
        dir: TempDir,
        model: PathBuf,
        mmproj: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("qwen2-vl-2b.gguf");
        let mmproj = dir.path().join("mmproj-qwen2-vl-2b-f16.gguf");
        fs::write(&model, b"GGUF").unwrap();
        fs::write(&mmproj, b"GGUF").unwrap();
        Fixture { dir, model, mmproj }
    }

    fn new_manager(engine: Arc<MockEngine>) -> (ModelManager, Reporter, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let (handle, reporter) = Reporter::spawn(buffer.clone()).unwrap();
        let manager = ModelManager::new(
            engine,
            EngineSettings::default(),
            GenerationSettings::default(),
            handle,
        );
        (manager, reporter, buffer)
    }

    #[test]
    fn test_second_load_is_a_no_op() {
        let fx = fixture();
        let engine = Arc::new(MockEngine::default());
        let (manager, _reporter, _buffer) = new_manager(engine.clone());

        assert_eq!(manager.status(), ModelStatus::Uninitialized);
        assert!(manager.ready_model().is_none());

        let first = manager.load(&fx.model, Some(&fx.mmproj)).unwrap();
        assert!(!first.already_loaded);
        let second = manager.load(&fx.model, Some(&fx.mmproj)).unwrap();
        assert!(second.already_loaded);
        // Different paths still do not reload.
        let third = manager.load(&fx.dir.path().join("other.gguf"), None).unwrap();
        assert!(third.already_loaded);

        assert_eq!(engine.load_calls(), 1);
        assert_eq!(manager.status(), ModelStatus::Ready);
        assert!(manager.ready_model().is_some());
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let fx = fixture();
        let engine = Arc::new(MockEngine::default().with_failing_loads(1));
        let (manager, _reporter, _buffer) = new_manager(engine.clone());

        let err = manager.load(&fx.model, Some(&fx.mmproj)).unwrap_err();
        assert!(matches!(err, LoadError::Engine(_)));
        assert_eq!(manager.status(), ModelStatus::Failed);
        assert!(manager.last_error().unwrap().contains("mock refused"));
        assert!(manager.ready_model().is_none());

        let report = manager.load(&fx.model, Some(&fx.mmproj)).unwrap();
        assert!(!report.already_loaded);
        assert_eq!(manager.status(), ModelStatus::Ready);
        assert_eq!(engine.load_calls(), 2);
        assert!(manager.last_error().is_none());
    }

    #[test]
    fn test_execution_mode_is_logged() {
        for (accelerated, expected) in [(true, "offloading"), (false, "falling back to CPU")] {
            let fx = fixture();
            let engine = Arc::new(MockEngine::default().with_acceleration(accelerated));
            let (manager, reporter, buffer) = new_manager(engine);
            manager.load(&fx.model, Some(&fx.mmproj)).unwrap();
            drop(manager);
            reporter.finish().unwrap();

            let logs: Vec<String> = buffer
                .messages()
                .into_iter()
                .filter_map(|m| match m {
                    OutputMessage::Log { msg } => Some(msg),
                    _ => None,
                })
                .collect();
            assert!(logs.iter().any(|m| m.contains(expected)), "{logs:?}");
        }
    }

    #[test]
    fn test_projector_is_found_next_to_model() {
        let fx = fixture();
        fs::write(fx.dir.path().join("zz-mmproj-extra.gguf"), b"GGUF").unwrap();
        fs::write(fx.dir.path().join("mmproj-notes.txt"), b"text").unwrap();

        assert_eq!(resolve_projector(&fx.model, None).unwrap(), fx.mmproj);
    }

    #[test]
    fn test_missing_projector_fails() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("text-only.gguf");
        fs::write(&model, b"GGUF").unwrap();

        let engine = Arc::new(MockEngine::default());
        let (manager, _reporter, _buffer) = new_manager(engine.clone());
        let err = manager.load(&model, None).unwrap_err();
        assert!(matches!(err, LoadError::NoProjector(_)));

        let err = manager
            .load(&model, Some(&dir.path().join("missing-mmproj.gguf")))
            .unwrap_err();
        assert!(matches!(err, LoadError::ProjectorNotFound(_)));
        assert_eq!(engine.load_calls(), 0);
        assert_eq!(manager.status(), ModelStatus::Failed);
    }

    #[test]
    fn test_missing_model_fails_without_touching_engine() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::default());
        let (manager, _reporter, _buffer) = new_manager(engine.clone());

        let missing = dir.path().join("absent.gguf");
        let err = manager.load(&missing, None).unwrap_err();
        assert!(err.to_string().contains("absent.gguf"));
        assert_eq!(engine.load_calls(), 0);
    }
}
