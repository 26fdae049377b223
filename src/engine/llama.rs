//! llama.cpp multimodal engine (`--features llama`).
//!
//! One `LlamaModel` + `MtmdContext` pair is loaded per process. Each task
//! builds its own `LlamaContext`, so decoding runs concurrently across the
//! pool; only image tokenization/evaluation goes through the projector mutex.
//!
//! Written against llama-cpp-2 0.1.159 (pinned in Cargo.toml).

use std::ffi::CString;
use std::fmt::Display;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, Mutex};

use encoding_rs::Decoder;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{LlamaChatMessage, LlamaModel};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use log::{debug, info};

use super::{ExecutionMode, InferenceEngine, LoadRequest, RuntimeTuning, VisionModel};
use crate::config::GenerationSettings;
use crate::error::EngineError;
use crate::worker::preprocess::EncodedImage;

/// Owns the process-wide llama.cpp backend. The backend can only be
/// initialized once, so it is kept across load retries.
pub struct LlamaEngine {
    backend: Mutex<Option<Arc<LlamaBackend>>>,
}

impl LlamaEngine {
    pub fn new() -> Self {
        Self {
            backend: Mutex::new(None),
        }
    }

    fn backend(&self) -> Result<Arc<LlamaBackend>, EngineError> {
        let mut guard = self.backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(backend) = guard.as_ref() {
            return Ok(backend.clone());
        }

        // llama.cpp logs are noisy and would otherwise land on stderr unformatted.
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(false));

        let backend = Arc::new(
            LlamaBackend::init().map_err(|e| EngineError::Load(format!("Failed to init backend: {e}")))?,
        );
        *guard = Some(backend.clone());
        Ok(backend)
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for LlamaEngine {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn supports_acceleration(&self) -> bool {
        self.backend()
            .map(|backend| backend.supports_gpu_offload())
            .unwrap_or(false)
    }

    fn load(&self, request: &LoadRequest) -> Result<Arc<dyn VisionModel>, EngineError> {
        let backend = self.backend()?;
        let tuning = &request.tuning;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(tuning.gpu_layers);
        info!(
            "[MODEL] Loading {} ({} gpu layers, {} threads)",
            request.model_path.display(),
            tuning.gpu_layers,
            tuning.n_threads
        );
        let model = LlamaModel::load_from_file(&backend, &request.model_path, &model_params)
            .map_err(|e| EngineError::Load(e.to_string()))?;

        let mmproj = path_str(&request.mmproj_path)?;
        let use_gpu = tuning.execution == ExecutionMode::Accelerated;
        info!("[MODEL] Vision: init mmproj from {mmproj}, use_gpu={use_gpu}");
        let vision_params = vision_params(tuning)?;
        let vision = MtmdContext::init_from_file(mmproj, &model, &vision_params)
            .map_err(|e| EngineError::Load(format!("Failed to init vision context: {e}")))?;
        if !vision.support_vision() {
            return Err(EngineError::Load(format!(
                "{mmproj} is not a vision projector"
            )));
        }

        Ok(Arc::new(LlamaVisionModel {
            vision: Mutex::new(vision),
            model,
            backend,
            tuning: tuning.clone(),
            generation: request.generation.clone(),
        }))
    }
}

/// Projector settings. Image token bounds are left to the projector's own
/// defaults (-1).
fn vision_params(tuning: &RuntimeTuning) -> Result<MtmdContextParams, EngineError> {
    Ok(MtmdContextParams {
        use_gpu: tuning.execution == ExecutionMode::Accelerated,
        print_timings: false,
        n_threads: to_i32(tuning.n_threads),
        media_marker: CString::new(mtmd_default_marker()).map_err(|e| EngineError::Load(e.to_string()))?,
        image_min_tokens: -1,
        image_max_tokens: -1,
    })
}

struct LlamaVisionModel {
    // Declared before `model` so it drops first; MtmdContext must not outlive it.
    vision: Mutex<MtmdContext>,
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    tuning: RuntimeTuning,
    generation: GenerationSettings,
}

impl VisionModel for LlamaVisionModel {
    fn describe(&self, image: &EncodedImage, prompt: &str) -> Result<String, EngineError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.tuning.context_size))
            .with_n_batch(self.tuning.batch_size)
            .with_n_threads(to_i32(self.tuning.n_threads))
            .with_n_threads_batch(to_i32(self.tuning.n_threads));
        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(inference)?;

        let template = self.model.chat_template(None).map_err(inference)?;
        let message = LlamaChatMessage::new(
            "user".to_string(),
            format!("{}\n{prompt}", mtmd_default_marker()),
        )
        .map_err(inference)?;
        let formatted = self
            .model
            .apply_chat_template(&template, &[message], true)
            .map_err(inference)?;

        let mut n_past = {
            let mut vision = self.vision.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let bitmap = MtmdBitmap::from_buffer(&vision, &image.bytes, false).map_err(inference)?;
            let chunks = vision
                .tokenize(
                    MtmdInputText {
                        text: formatted,
                        add_special: true,
                        parse_special: true,
                    },
                    &[&bitmap],
                )
                .map_err(inference)?;
            chunks
                .eval_chunks(&mut vision, &mut ctx, 0, 0, to_i32(self.tuning.batch_size), true)
                .map_err(inference)?
        };
        debug!("[MODEL] Prompt evaluated ({n_past} positions) for {}", image.source.display());

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(self.generation.temperature),
            LlamaSampler::dist(self.generation.seed),
        ]);
        let vocab = self.model.vocab();
        let mut batch = LlamaBatch::new(1, 1);
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output = String::new();

        for _ in 0..self.generation.max_tokens {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);
            if vocab.is_eog(token) {
                break;
            }
            push_piece(&mut decoder, &vocab.token_to_piece(token, true, None), &mut output);

            batch.clear();
            batch.add(token, n_past, &[0], true).map_err(inference)?;
            n_past += 1;
            ctx.decode(&mut batch).map_err(inference)?;
        }

        Ok(output.trim().to_string())
    }
}

/// Append a token's bytes to `out`. A multi-byte character split across
/// tokens is held in the decoder until its remaining bytes arrive.
fn push_piece(decoder: &mut Decoder, bytes: &[u8], out: &mut String) {
    let needed = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len() * 3 + 4);
    out.reserve(needed);
    let _ = decoder.decode_to_string(bytes, out, false);
}

fn inference(e: impl Display) -> EngineError {
    EngineError::Inference(e.to_string())
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn path_str(path: &Path) -> Result<&str, EngineError> {
    path.to_str()
        .ok_or_else(|| EngineError::Load(format!("path is not valid UTF-8: {}", path.display())))
}
