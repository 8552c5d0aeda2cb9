use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::text;

const PERMALINK_BASE: &str = "https://t.me";

/// A message as delivered by a [`crate::source::MessageSource`].
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: i64,
    pub text: String,
    pub has_media: bool,
    pub date: DateTime<Utc>,
}

/// One entry of the rendered feed. Built once per qualifying message.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub guid: String,
    pub published_at: DateTime<Utc>,
    pub body_html: String,
    pub source_link: String,
}

impl FeedItem {
    /// `channel` must already be in `@name` form.
    pub fn from_message(channel: &str, message: &RawMessage) -> Self {
        let content = text::clean_text(&message.text);
        let source_link = permalink(channel, message.id);
        let link = match text::extract_first_url(&content) {
            Some(url) => url.to_string(),
            None => source_link.clone(),
        };

        let title = if content.is_empty() {
            format!("Post {} on {}", message.id, channel)
        } else {
            text::title_line(&content)
        };

        Self {
            title,
            guid: item_guid(&link, &format!("{}-{}", channel, message.id)),
            link,
            published_at: message.date,
            body_html: text::to_html(&content),
            source_link,
        }
    }

    /// Visible stand-in for a channel that could not be read.
    pub fn channel_error(channel: &str, error: &str, feed_link: &str, now: DateTime<Utc>) -> Self {
        let err_text = format!("Error reading {}: {}", channel, error);
        Self {
            title: format!("Error reading {}", channel),
            link: feed_link.to_string(),
            guid: item_guid("", &err_text),
            published_at: now,
            body_html: text::escape(&err_text),
            source_link: feed_link.to_string(),
        }
    }

    pub fn is_permalink(&self) -> bool {
        self.guid.starts_with("http")
    }
}

/// Canonical `@name` form used for cursor keys and placeholders.
pub fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim();
    if channel.starts_with('@') {
        channel.to_string()
    } else {
        format!("@{}", channel)
    }
}

/// Public link to a post. Works for public channels and supergroups.
pub fn permalink(channel: &str, id: i64) -> String {
    format!("{}/{}/{}", PERMALINK_BASE, channel.trim_start_matches('@'), id)
}

/// The link itself when present, otherwise a `urn:sha1:` hash of `fallback`.
pub fn item_guid(link: &str, fallback: &str) -> String {
    if !link.is_empty() {
        return link.to_string();
    }
    let digest = Sha1::digest(fallback.as_bytes());
    format!("urn:sha1:{:x}", digest)
}
