use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::{error, info};

mod config;
mod cursor;
mod db;
mod error;
mod feed;
mod fetcher;
mod filter;
mod logger;
mod models;
mod pipeline;
mod source;
mod text;

use config::{Config, ConfigPaths, StateBackend};
use cursor::JsonCursorStore;
use error::ConfigError;
use source::WebMirrorSource;

/// Builds an RSS feed from recent posts of public Telegram channels.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Feed, source and state settings
    #[arg(short, long, default_value = "tgrss.yml")]
    config: PathBuf,

    /// YAML file with a `channels` list
    #[arg(long, default_value = "channels.yml")]
    channels: PathBuf,

    /// YAML file with a `keywords` list
    #[arg(long, default_value = "keywords.yml")]
    keywords: PathBuf,

    /// Overrides `feed.output`
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the feed to stdout and persist nothing
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_config = logger::LogConfig {
        console_level: logger::parse_log_level(&args.log_level),
        log_file: args.log_file.clone(),
        ..Default::default()
    };
    if let Err(e) = logger::init(log_config) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!("Configuration error: {:#}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let paths = ConfigPaths {
        config: args.config,
        channels: args.channels,
        keywords: args.keywords,
    };
    let mut config = Config::load(&paths, |key| std::env::var(key).ok())?;
    if let Some(output) = args.output {
        config.feed.output = output;
    }

    let source = WebMirrorSource::new(&config.source)?;
    let now = Utc::now();

    let outcome = match config.state.backend {
        StateBackend::Json => {
            let store = JsonCursorStore::new(&config.state.path);
            pipeline::run(&config, &source, &store, now, args.dry_run).await?
        }
        StateBackend::Sqlite => {
            let store = db::Database::new(&config.state.path).await?;
            pipeline::run(&config, &source, &store, now, args.dry_run).await?
        }
    };

    info!(
        "Done: {} posts collected, {} channels tracked",
        outcome.collected,
        outcome.cursors.len()
    );
    if args.dry_run {
        println!("{}", outcome.xml);
    }

    Ok(())
}
