//! Worker configuration.
//!
//! Everything is a command line flag with an environment fallback, so the
//! host can tune the worker either way when it spawns the child process.

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_MAX_IMAGE_SIDE: u32 = 768;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
/// "Summarize this image in Chinese". The host stores and searches Chinese summaries.
pub const DEFAULT_PROMPT: &str = "请使用中文摘要这张图片";
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// llama.cpp treats this seed as "pick a random one".
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
pub const DEFAULT_BATCH_SIZE: u32 = 1024;
/// More layers than any supported model has, i.e. offload everything.
pub const DEFAULT_GPU_LAYERS: u32 = 999;

/// Command line of the `vision-worker` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vision-worker",
    version,
    about = "Out-of-process image summarization worker (JSON Lines over stdin/stdout)"
)]
pub struct WorkerArgs {
    /// Number of tasks processed concurrently.
    #[arg(long, env = "VISION_WORKER_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE, value_parser = parse_pool_size)]
    pub pool_size: usize,

    /// Longest allowed image side in pixels; larger images are downsampled.
    #[arg(long, env = "VISION_WORKER_MAX_IMAGE_SIDE", default_value_t = DEFAULT_MAX_IMAGE_SIDE, value_parser = clap::value_parser!(u32).range(16..))]
    pub max_image_side: u32,

    /// JPEG quality used when re-encoding images.
    #[arg(long, env = "VISION_WORKER_JPEG_QUALITY", default_value_t = DEFAULT_JPEG_QUALITY, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    /// Instruction sent to the model together with each image.
    #[arg(long, env = "VISION_WORKER_PROMPT", default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Maximum number of tokens generated per image.
    #[arg(long, env = "VISION_WORKER_MAX_TOKENS", default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    #[arg(long, env = "VISION_WORKER_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    #[arg(long, env = "VISION_WORKER_SEED", default_value_t = DEFAULT_SEED)]
    pub seed: u32,

    #[arg(long, env = "VISION_WORKER_CONTEXT_SIZE", default_value_t = DEFAULT_CONTEXT_SIZE)]
    pub context_size: u32,

    #[arg(long, env = "VISION_WORKER_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: u32,

    /// Layers offloaded to the GPU when acceleration is available.
    #[arg(long, env = "VISION_WORKER_GPU_LAYERS", default_value_t = DEFAULT_GPU_LAYERS)]
    pub gpu_layers: u32,

    /// Engine threads. Defaults to a quarter of the logical CPUs.
    #[arg(long, env = "VISION_WORKER_THREADS", value_parser = clap::value_parser!(u32).range(1..))]
    pub threads: Option<u32>,

    #[arg(long, env = "VISION_WORKER_LOG_LEVEL", default_value_t = LevelFilter::Info)]
    pub log_level: LevelFilter,

    /// Also write diagnostics to a timestamped file in this directory.
    #[arg(long, env = "VISION_WORKER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

fn parse_pool_size(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|e| format!("invalid pool size '{s}': {e}"))?;
    if (1..=64).contains(&n) {
        Ok(n)
    } else {
        Err(format!("pool size must be between 1 and 64, got {n}"))
    }
}

/// Image preprocessing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessSettings {
    pub max_side: u32,
    pub jpeg_quality: u8,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_IMAGE_SIDE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Per-request generation knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub seed: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            seed: DEFAULT_SEED,
        }
    }
}

/// Load-time engine knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub context_size: u32,
    pub batch_size: u32,
    pub gpu_layers: u32,
    /// Overrides the derived thread count.
    pub threads: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            gpu_layers: DEFAULT_GPU_LAYERS,
            threads: None,
        }
    }
}

/// Resolved configuration consumed by [`crate::worker::run_worker`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub preprocess: PreprocessSettings,
    pub generation: GenerationSettings,
    pub engine: EngineSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            preprocess: PreprocessSettings::default(),
            generation: GenerationSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl From<&WorkerArgs> for WorkerConfig {
    fn from(args: &WorkerArgs) -> Self {
        Self {
            pool_size: args.pool_size,
            preprocess: PreprocessSettings {
                max_side: args.max_image_side,
                jpeg_quality: args.jpeg_quality,
            },
            generation: GenerationSettings {
                prompt: args.prompt.clone(),
                max_tokens: args.max_tokens,
                temperature: args.temperature,
                seed: args.seed,
            },
            engine: EngineSettings {
                context_size: args.context_size,
                batch_size: args.batch_size,
                gpu_layers: args.gpu_layers,
                threads: args.threads,
            },
        }
    }
}

/// Engine thread count: a quarter of the logical CPUs, at least one.
///
/// Leaves room for the host application and for the pool's own concurrency.
pub fn derive_thread_count(logical_cpus: usize) -> u32 {
    u32::try_from(logical_cpus / 4).unwrap_or(u32::MAX).max(1)
}

/// Logical CPUs visible to this process.
pub fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    /// Parse flags only; VISION_WORKER_* variables set in the test
    /// environment are ignored.
    fn parse(argv: &[&str]) -> Result<WorkerArgs, clap::Error> {
        let matches = WorkerArgs::command()
            .mut_args(|arg| arg.env(None::<&str>))
            .try_get_matches_from(argv.iter().copied())?;
        WorkerArgs::from_arg_matches(&matches)
    }

    #[test]
    fn test_derive_thread_count() {
        assert_eq!(derive_thread_count(0), 1);
        assert_eq!(derive_thread_count(1), 1);
        assert_eq!(derive_thread_count(3), 1);
        assert_eq!(derive_thread_count(4), 1);
        assert_eq!(derive_thread_count(8), 2);
        assert_eq!(derive_thread_count(16), 4);
        assert_eq!(derive_thread_count(33), 8);
    }

    #[test]
    fn test_args_defaults() {
        let args = parse(&["vision-worker"]).unwrap();
        let config = WorkerConfig::from(&args);
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.preprocess, PreprocessSettings::default());
        assert_eq!(config.engine.context_size, 2048);
        assert_eq!(config.engine.batch_size, 1024);
        assert_eq!(config.engine.threads, None);
        assert_eq!(config.generation.max_tokens, 512);
        assert_eq!(config.generation.prompt, "请使用中文摘要这张图片");
        assert_eq!(config.generation, GenerationSettings::default());
        assert_eq!(args.log_level, LevelFilter::Info);
        assert!(args.log_dir.is_none());
    }

    #[test]
    fn test_args_overrides() {
        let args = parse(&[
            "vision-worker",
            "--pool-size",
            "5",
            "--max-image-side",
            "512",
            "--threads",
            "2",
            "--prompt",
            "describe",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let config = WorkerConfig::from(&args);
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.preprocess.max_side, 512);
        assert_eq!(config.engine.threads, Some(2));
        assert_eq!(config.generation.prompt, "describe");
        assert_eq!(args.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_args_reject_out_of_range() {
        assert!(parse(&["vision-worker", "--pool-size", "0"]).is_err());
        assert!(parse(&["vision-worker", "--pool-size", "65"]).is_err());
        assert!(parse(&["vision-worker", "--jpeg-quality", "0"]).is_err());
        assert!(parse(&["vision-worker", "--threads", "0"]).is_err());
    }
}
