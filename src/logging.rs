//! Diagnostic logging.
//!
//! stdout carries the protocol, so log records go to stderr (inherited by the
//! host) and, when a log directory is configured, to a timestamped file.

use std::error::Error;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Build the log4rs configuration. Returns the log file path, if any.
pub fn build_config(
    level: LevelFilter,
    log_dir: Option<&Path>,
) -> Result<(Config, Option<PathBuf>), Box<dyn Error>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    let mut log_path = None;
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;
        let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
        let path = dir.join(format!("{timestamp}.log"));
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(&path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
        log_path = Some(path);
    }

    let config = builder.build(root.build(level))?;
    Ok((config, log_path))
}

/// Install the global logger. Can only succeed once per process.
pub fn setup_logging(level: LevelFilter, log_dir: Option<&Path>) -> Result<Option<PathBuf>, Box<dyn Error>> {
    let (config, log_path) = build_config(level, log_dir)?;
    log4rs::init_config(config)?;
    Ok(log_path)
}
