//! Inference engine capability.
//!
//! The worker only needs three things from an engine: whether accelerated
//! execution is available, loading a model + vision projector pair, and
//! turning an image plus a prompt into text. Everything else (architecture,
//! tokenization, sampling internals) stays behind these traits.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{EngineSettings, GenerationSettings};
use crate::error::EngineError;
use crate::worker::preprocess::EncodedImage;

#[cfg(feature = "llama")]
pub mod llama;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// How the engine will execute the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// GPU offload available.
    Accelerated,
    /// CPU only.
    CpuFallback,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Accelerated => f.write_str("accelerated"),
            ExecutionMode::CpuFallback => f.write_str("cpu fallback"),
        }
    }
}

/// Runtime tuning derived once per load.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeTuning {
    pub execution: ExecutionMode,
    pub n_threads: u32,
    /// Zero in CPU fallback mode.
    pub gpu_layers: u32,
    pub context_size: u32,
    pub batch_size: u32,
}

impl RuntimeTuning {
    pub fn derive(settings: &EngineSettings, execution: ExecutionMode, logical_cpus: usize) -> Self {
        let gpu_layers = match execution {
            ExecutionMode::Accelerated => settings.gpu_layers,
            ExecutionMode::CpuFallback => 0,
        };
        Self {
            execution,
            n_threads: settings
                .threads
                .unwrap_or_else(|| crate::config::derive_thread_count(logical_cpus)),
            gpu_layers,
            context_size: settings.context_size,
            batch_size: settings.batch_size,
        }
    }
}

/// Everything an engine needs to construct a model handle.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    pub mmproj_path: PathBuf,
    pub tuning: RuntimeTuning,
    pub generation: GenerationSettings,
}

/// A loaded multimodal model. Shared read-only across the worker pool.
pub trait VisionModel: Send + Sync {
    /// Generate text for `image` following `prompt`.
    fn describe(&self, image: &EncodedImage, prompt: &str) -> Result<String, EngineError>;
}

/// Factory for model handles.
pub trait InferenceEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this build/machine can offload work to a GPU.
    fn supports_acceleration(&self) -> bool;

    fn load(&self, request: &LoadRequest) -> Result<Arc<dyn VisionModel>, EngineError>;
}

/// Engine used when the binary was built without a backend feature.
/// Every load fails, so the protocol still answers `init` sensibly.
#[derive(Debug, Default)]
pub struct UnavailableEngine;

impl InferenceEngine for UnavailableEngine {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn supports_acceleration(&self) -> bool {
        false
    }

    fn load(&self, _request: &LoadRequest) -> Result<Arc<dyn VisionModel>, EngineError> {
        Err(EngineError::Unavailable(
            "this build has no inference backend (rebuild with --features llama)".to_string(),
        ))
    }
}

/// Engine selected at compile time for the binary.
#[cfg(feature = "mock")]
pub fn default_engine() -> Arc<dyn InferenceEngine> {
    Arc::new(mock::MockEngine::default())
}

/// Engine selected at compile time for the binary.
#[cfg(all(feature = "llama", not(feature = "mock")))]
pub fn default_engine() -> Arc<dyn InferenceEngine> {
    Arc::new(llama::LlamaEngine::new())
}

/// Engine selected at compile time for the binary.
#[cfg(not(any(feature = "llama", feature = "mock")))]
pub fn default_engine() -> Arc<dyn InferenceEngine> {
    Arc::new(UnavailableEngine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_accelerated_offloads_layers() {
        let settings = EngineSettings::default();
        let tuning = RuntimeTuning::derive(&settings, ExecutionMode::Accelerated, 16);
        assert_eq!(tuning.n_threads, 4);
        assert_eq!(tuning.gpu_layers, settings.gpu_layers);
        assert_eq!(tuning.context_size, 2048);
    }

    #[test]
    fn test_tuning_fallback_keeps_layers_on_cpu() {
        let tuning = RuntimeTuning::derive(&EngineSettings::default(), ExecutionMode::CpuFallback, 2);
        assert_eq!(tuning.n_threads, 1);
        assert_eq!(tuning.gpu_layers, 0);
    }

    #[test]
    fn test_tuning_thread_override() {
        let settings = EngineSettings {
            threads: Some(6),
            ..EngineSettings::default()
        };
        let tuning = RuntimeTuning::derive(&settings, ExecutionMode::CpuFallback, 64);
        assert_eq!(tuning.n_threads, 6);
    }

    #[test]
    fn test_unavailable_engine_refuses_to_load() {
        let request = LoadRequest {
            model_path: "m.gguf".into(),
            mmproj_path: "mmproj.gguf".into(),
            tuning: RuntimeTuning::derive(&EngineSettings::default(), ExecutionMode::CpuFallback, 4),
            generation: GenerationSettings::default(),
        };
        let err = UnavailableEngine.load(&request).err().unwrap();
        assert!(err.to_string().contains("--features llama"));
    }
}
