use std::io;
use std::path::PathBuf;

use anyhow::Result;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Log configuration options
pub struct LogConfig {
    /// Log level for console output
    pub console_level: LevelFilter,
    /// Log level for file output
    pub file_level: LevelFilter,
    /// Path to log file (None means no file logging)
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: LevelFilter::Info,
            file_level: LevelFilter::Debug,
            log_file: None,
        }
    }
}

/// Installs the global logger. Console output goes to stderr so that
/// `--dry-run` can print the document on stdout.
pub fn init(config: LogConfig) -> Result<()> {
    // Only the level tag is colored; the file sink gets the same escape codes
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::Magenta);

    // Shared line format: local time, module, level
    let base_config = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        // Let everything through here, each sink applies its own level
        .level(LevelFilter::Trace)
        // sqlx logs every statement at info
        .level_for("sqlx", LevelFilter::Warn);

    // stdout is reserved for the document in dry-run mode
    let console_config = fern::Dispatch::new()
        .level(config.console_level)
        .chain(io::stderr());

    let mut log_config = base_config.chain(console_config);

    // Optional file sink, usually at a more verbose level than the console
    if let Some(log_file) = config.log_file {
        let file_config = fern::Dispatch::new()
            .level(config.file_level)
            .chain(fern::log_file(log_file)?);

        log_config = log_config.chain(file_config);
    }

    // Fails if a logger is already installed
    log_config.apply()?;

    Ok(())
}

/// Converts a level name to a filter, falling back to `Info`.
pub fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
