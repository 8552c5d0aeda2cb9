use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;

use crate::config::Config;
use crate::cursor::{CursorStore, Cursors};
use crate::feed::{self, FeedAssembler};
use crate::fetcher::ChannelFetcher;
use crate::source::MessageSource;

/// Result of one pass.
#[derive(Debug)]
pub struct RunOutcome {
    pub xml: String,
    pub cursors: Cursors,
    pub collected: usize,
}

/// One fetch, render and persist pass.
///
/// Nothing is written until the document has been rendered; the document goes
/// first and the cursors last, so an interrupted run leaves the previous
/// outputs in place. With `dry_run` nothing is written at all.
pub async fn run<S, C>(
    config: &Config,
    source: &S,
    store: &C,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<RunOutcome>
where
    S: MessageSource,
    C: CursorStore,
{
    let cutoff = now - config.feed.retention();
    info!(
        "Fetching posts from last {} days (since {})",
        config.feed.days,
        cutoff.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let mut cursors = store.load().await.context("failed to load cursor state")?;
    if cursors.is_empty() {
        info!("No cursor state yet, reading channels from the beginning");
    }
    let items = ChannelFetcher::new(source, config)
        .fetch_all(&mut cursors, now)
        .await;
    let collected = items.len();
    info!("Total posts collected: {}", collected);

    let xml = FeedAssembler::new(&config.feed).assemble(items, now)?;

    if dry_run {
        info!("Dry run, leaving {} and cursor state untouched", config.feed.output.display());
    } else {
        feed::write_document(&config.feed.output, &xml)?;
        store.save(&cursors).await.context("failed to save cursor state")?;
        info!("Feed written to {}", config.feed.output.display());
    }

    Ok(RunOutcome {
        xml,
        cursors,
        collected,
    })
}
