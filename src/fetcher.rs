use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::cursor::Cursors;
use crate::error::SourceError;
use crate::filter::KeywordFilter;
use crate::models::{normalize_channel, FeedItem};
use crate::source::MessageSource;

/// What one successful pass over a channel produced.
#[derive(Debug, Default)]
struct ChannelFetch {
    items: Vec<FeedItem>,
    max_id: Option<i64>,
}

/// Walks the configured channels in order and turns their new messages into
/// feed items, advancing the cursors as it goes.
pub struct ChannelFetcher<'a, S> {
    source: &'a S,
    config: &'a Config,
    filter: KeywordFilter,
}

impl<'a, S: MessageSource> ChannelFetcher<'a, S> {
    pub fn new(source: &'a S, config: &'a Config) -> Self {
        Self {
            source,
            config,
            filter: KeywordFilter::new(&config.keywords),
        }
    }

    /// Reads every channel once. Channel failures become error items; only
    /// qualifying messages from successful reads move a cursor.
    pub async fn fetch_all(&self, cursors: &mut Cursors, now: DateTime<Utc>) -> Vec<FeedItem> {
        let cutoff = now - self.config.feed.retention();
        let mut items = Vec::new();
        if self.filter.is_empty() {
            debug!("No keywords configured, keeping every post");
        }

        for configured in &self.config.channels {
            let channel = normalize_channel(configured);
            // Read once per channel; a retry starts from the same cursor.
            let min_id = cursors.get(&channel);
            let mut retries = 0;

            loop {
                info!("Fetching from {}...", channel);
                match self.fetch_channel(&channel, min_id, cutoff).await {
                    Ok(fetch) => {
                        // No qualifying message leaves the cursor where it was
                        if let Some(max_id) = fetch.max_id {
                            cursors.advance(&channel, max_id);
                        }
                        info!("  Added {} posts from {}", fetch.items.len(), channel);
                        items.extend(fetch.items);
                        break;
                    }
                    Err(SourceError::RateLimited { retry_after })
                        if retries < self.config.source.max_rate_limit_retries =>
                    {
                        // Whatever the failed attempt collected is dropped with it
                        retries += 1;
                        warn!(
                            "Rate limited, waiting {} seconds before retrying {}...",
                            retry_after.as_secs(),
                            channel
                        );
                        tokio::time::sleep(retry_after).await;
                    }
                    // Out of retries or a hard failure: report it in the feed and move on
                    Err(e) => {
                        error!("Error reading {}: {}", channel, e);
                        items.push(FeedItem::channel_error(
                            &channel,
                            &e.to_string(),
                            &self.config.feed.link,
                            now,
                        ));
                        break;
                    }
                }
            }
        }

        items
    }

    async fn fetch_channel(
        &self,
        channel: &str,
        min_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<ChannelFetch, SourceError> {
        let mut fetch = ChannelFetch::default();
        let mut messages = self
            .source
            .messages(channel, min_id, self.config.source.page_limit);

        while let Some(message) = messages.next().await {
            let message = message?;

            // Sources list newest first, so everything after this is older too.
            if message.date < cutoff {
                info!(
                    "  Reached posts older than {} days in {}, stopping...",
                    self.config.feed.days, channel
                );
                break;
            }

            // Nothing to show: no text and no attachment
            if message.text.trim().is_empty() && !message.has_media {
                continue;
            }
            if !self.filter.matches(&message.text) {
                debug!("  Skipping {} #{}: no keyword match", channel, message.id);
                continue;
            }

            // Only kept messages count towards the new cursor
            fetch.items.push(FeedItem::from_message(channel, &message));
            fetch.max_id = Some(fetch.max_id.map_or(message.id, |max| max.max(message.id)));
        }

        Ok(fetch)
    }
}
