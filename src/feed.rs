use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rss::{Channel, Guid, Item};

use crate::config::FeedConfig;
use crate::cursor::write_replacing;
use crate::models::FeedItem;
use crate::text;

const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

/// Turns the collected items into the final RSS 2.0 document.
pub struct FeedAssembler<'a> {
    config: &'a FeedConfig,
}

impl<'a> FeedAssembler<'a> {
    pub fn new(config: &'a FeedConfig) -> Self {
        Self { config }
    }

    /// Filters, orders and renders `items` as of `now`.
    pub fn assemble(&self, items: Vec<FeedItem>, now: DateTime<Utc>) -> Result<String> {
        let selected = self.select(items, now);
        info!("Rendering {} items", selected.len());
        self.render(&selected, now)
    }

    /// Drops items outside the retention window, sorts newest first (ties keep
    /// their input order) and keeps at most `limit`.
    pub fn select(&self, mut items: Vec<FeedItem>, now: DateTime<Utc>) -> Vec<FeedItem> {
        let cutoff = now - self.config.retention();
        items.retain(|item| item.published_at >= cutoff);
        items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        items.truncate(self.config.limit);
        items
    }

    pub fn render(&self, items: &[FeedItem], now: DateTime<Utc>) -> Result<String> {
        let mut channel = Channel::default();
        channel.set_title(text::strip_control(&self.config.title));
        channel.set_link(text::strip_control(&self.config.link));
        channel.set_description(text::strip_control(&self.config.description));
        channel.set_language(self.config.language.clone());
        channel.set_last_build_date(format_date(now));
        channel.set_items(items.iter().map(to_rss_item).collect::<Vec<_>>());

        let buf = channel
            .write_to(Vec::new())
            .context("failed to render feed document")?;
        let xml = String::from_utf8(buf).context("rendered feed is not UTF-8")?;
        Ok(xml)
    }
}

fn to_rss_item(item: &FeedItem) -> Item {
    let mut guid = Guid::default();
    guid.set_value(item.guid.clone());
    guid.set_permalink(item.is_permalink());

    let mut rss_item = Item::default();
    rss_item.set_title(text::strip_control(&item.title));
    rss_item.set_link(text::strip_control(&item.link));
    rss_item.set_guid(guid);
    rss_item.set_pub_date(format_date(item.published_at));
    rss_item.set_description(format!(
        "{}<br/><br/>Source: <a href=\"{}\">Telegram</a>",
        item.body_html,
        text::escape(&item.source_link)
    ));
    rss_item
}

/// RFC 2822 style with a fixed `+0000` offset.
pub fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Replaces the document on disk in one step.
pub fn write_document(path: &Path, xml: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    write_replacing(path, xml.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!("Wrote {} bytes to {}", xml.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawMessage;
    use chrono::{Duration, TimeZone};

    fn item(guid: &str, published_at: DateTime<Utc>) -> FeedItem {
        FeedItem {
            title: format!("title {}", guid),
            link: guid.to_string(),
            guid: guid.to_string(),
            published_at,
            body_html: "body &amp; more<br/>line".to_string(),
            source_link: "https://t.me/acme/1?a=1&b=2".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 8, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_format_date() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 3).unwrap();
        assert_eq!(format_date(date), "Wed, 01 May 2024 09:05:03 +0000");
    }

    #[test]
    fn test_select_drops_old_sorts_and_truncates() {
        let config = FeedConfig {
            limit: 2,
            ..FeedConfig::default()
        };
        let assembler = FeedAssembler::new(&config);
        let now = now();

        let items = vec![
            item("https://a", now - Duration::hours(5)),
            item("https://old", now - Duration::days(8)),
            item("https://b", now - Duration::hours(1)),
            item("https://c", now - Duration::hours(3)),
        ];
        let selected = assembler.select(items, now);

        let guids: Vec<_> = selected.iter().map(|i| i.guid.as_str()).collect();
        assert_eq!(guids, vec!["https://b", "https://c"]);
        assert!(selected.iter().all(|i| i.published_at >= now - config.retention()));
    }

    #[test]
    fn test_select_keeps_input_order_on_ties() {
        let config = FeedConfig::default();
        let assembler = FeedAssembler::new(&config);
        let now = now();
        let at = now - Duration::hours(2);

        let items = vec![item("https://first", at), item("https://second", at), item("https://third", at)];
        let selected = assembler.select(items, now);

        let guids: Vec<_> = selected.iter().map(|i| i.guid.as_str()).collect();
        assert_eq!(guids, vec!["https://first", "https://second", "https://third"]);
    }

    #[test]
    fn test_render_is_readable_by_feed_parser() {
        let config = FeedConfig {
            title: "Tech & <Stuff>".to_string(),
            ..FeedConfig::default()
        };
        let assembler = FeedAssembler::new(&config);
        let now = now();
        let items = vec![
            item("https://example.com/x", now - Duration::hours(1)),
            item("urn:sha1:abc", now - Duration::hours(2)),
        ];

        let xml = assembler.render(&items, now).unwrap();
        assert!(xml.contains("<rss"));
        assert!(xml.contains("<lastBuildDate>Wed, 08 May 2024 12:00:00 +0000</lastBuildDate>"));
        assert!(xml.contains("<language>en</language>"));
        assert!(xml.contains("isPermaLink=\"false\""));
        assert_eq!(xml.matches("<item>").count(), 2);

        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        assert_eq!(feed.title.unwrap().content, "Tech & <Stuff>");
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.id, "https://example.com/x");
        assert_eq!(first.links[0].href, "https://example.com/x");
        assert_eq!(first.published, Some(now - Duration::hours(1)));
        let summary = first.summary.as_ref().unwrap().content.as_str();
        assert!(summary.contains("Source:"));
        assert!(summary.contains("https://t.me/acme/1?a=1"));
        assert!(summary.contains("more<br/>line"));

        assert_eq!(feed.entries[1].id, "urn:sha1:abc");
    }

    #[test]
    fn test_control_characters_never_reach_the_document() {
        let config = FeedConfig {
            title: "Feed\u{1}".to_string(),
            ..FeedConfig::default()
        };
        let now = now();
        let message = RawMessage {
            id: 4,
            text: "bell\u{7} here\u{b}".to_string(),
            has_media: false,
            date: now - Duration::hours(1),
        };
        let items = vec![
            FeedItem::from_message("@acme", &message),
            FeedItem::channel_error("@acme", "bad\u{2} byte", &config.link, now),
        ];

        let xml = FeedAssembler::new(&config).assemble(items, now).unwrap();
        assert!(!xml.chars().any(|c| c < '\u{20}' && !matches!(c, '\t' | '\n' | '\r')));
        assert!(xml.contains("bell here"));
        assert_eq!(xml.matches("<item>").count(), 2);
    }

    #[test]
    fn test_assemble_bounds_item_count() {
        let config = FeedConfig {
            limit: 3,
            ..FeedConfig::default()
        };
        let now = now();
        let items = (0..10)
            .map(|i| item(&format!("https://example.com/{}", i), now - Duration::minutes(i)))
            .collect();

        let xml = FeedAssembler::new(&config).assemble(items, now).unwrap();
        assert_eq!(xml.matches("<item>").count(), 3);
    }

    #[test]
    fn test_empty_feed_is_still_valid() {
        let config = FeedConfig::default();
        let xml = FeedAssembler::new(&config).assemble(Vec::new(), now()).unwrap();
        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        assert!(feed.entries.is_empty());
    }

    #[test]
    fn test_write_document_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("feed.xml");
        write_document(&path, "<rss>old</rss>").unwrap();
        write_document(&path, "<rss>new</rss>").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<rss>new</rss>");
        assert!(!dir.path().join("out").join("feed.xml.tmp").exists());
    }
}
