use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, LocalBoxStream, StreamExt};
use log::debug;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use scraper::node::Node;
use scraper::{CaseSensitivity, ElementRef, Html, Selector};

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::RawMessage;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Anything that can list a channel's messages.
pub trait MessageSource {
    /// Messages of `channel` with an id strictly above `min_id`, newest first,
    /// at most `limit` of them. Pages are fetched lazily, so dropping the
    /// stream stops further requests.
    fn messages<'a>(
        &'a self,
        channel: &'a str,
        min_id: i64,
        limit: usize,
    ) -> LocalBoxStream<'a, Result<RawMessage, SourceError>>;
}

/// Reads the public web mirror of a channel (`https://t.me/s/<name>`).
pub struct WebMirrorSource {
    client: Client,
    base_url: String,
}

struct PageState {
    buffer: VecDeque<RawMessage>,
    before: Option<i64>,
    yielded: usize,
    exhausted: bool,
}

impl WebMirrorSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        // One client for every channel, so connections are reused
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(&self, name: &str, before: Option<i64>) -> Result<Vec<RawMessage>, SourceError> {
        let mut url = format!("{}/s/{}", self.base_url, name);
        if let Some(before) = before {
            url.push_str(&format!("?before={}", before));
        }
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        // 429 is the only status worth waiting out
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(SourceError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let html = response.text().await?;
        parse_page(&html)
    }

    async fn next_message(
        &self,
        name: &str,
        min_id: i64,
        limit: usize,
        mut state: PageState,
    ) -> Result<Option<(RawMessage, PageState)>, SourceError> {
        loop {
            // Page limit reached
            if state.yielded >= limit {
                return Ok(None);
            }
            if let Some(message) = state.buffer.pop_front() {
                // Everything from here on was seen by an earlier run
                if message.id <= min_id {
                    return Ok(None);
                }
                state.yielded += 1;
                return Ok(Some((message, state)));
            }
            if state.exhausted {
                return Ok(None);
            }

            let mut page = self.fetch_page(name, state.before).await?;
            // The mirror lists oldest first within a page.
            page.sort_by(|a, b| b.id.cmp(&a.id));
            if let Some(before) = state.before {
                page.retain(|m| m.id < before);
            }

            // Continue below the oldest id of this page; id 1 is the channel's first post
            match page.last() {
                Some(oldest) => {
                    state.exhausted = oldest.id <= 1;
                    state.before = Some(oldest.id);
                }
                None => state.exhausted = true,
            }
            state.buffer.extend(page);
        }
    }
}

impl MessageSource for WebMirrorSource {
    fn messages<'a>(
        &'a self,
        channel: &'a str,
        min_id: i64,
        limit: usize,
    ) -> LocalBoxStream<'a, Result<RawMessage, SourceError>> {
        let name = channel.trim_start_matches('@');
        let init = PageState {
            buffer: VecDeque::new(),
            before: None,
            yielded: 0,
            exhausted: false,
        };

        stream::try_unfold(init, move |state| {
            self.next_message(name, min_id, limit, state)
        })
        .boxed_local()
    }
}

/// Delay in whole seconds. HTTP dates are not used by the mirror.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Malformed(e.to_string()))
}

/// Extracts the messages of one mirror page, in page order.
pub fn parse_page(html: &str) -> Result<Vec<RawMessage>, SourceError> {
    let document = Html::parse_document(html);
    let message_selector = selector("div.tgme_widget_message[data-post]")?;
    let text_selector = selector("div.tgme_widget_message_text")?;
    let date_selector = selector("a.tgme_widget_message_date time[datetime]")?;
    let media_selector = selector(
        ".tgme_widget_message_photo_wrap, .tgme_widget_message_video_player, \
         .tgme_widget_message_roundvideo_player, .tgme_widget_message_document, \
         .tgme_widget_message_voice, .tgme_widget_message_sticker_wrap, \
         .tgme_widget_message_poll",
    )?;

    let mut messages = Vec::new();

    for element in document.select(&message_selector) {
        // data-post looks like "channel/123"
        let post = element.value().attr("data-post").unwrap_or_default();
        let id = post
            .rsplit('/')
            .next()
            .and_then(|id| id.parse::<i64>().ok())
            .ok_or_else(|| SourceError::Malformed(format!("bad post reference {:?}", post)))?;

        let datetime = element
            .select(&date_selector)
            .next()
            .and_then(|time| time.value().attr("datetime"))
            .ok_or_else(|| SourceError::Malformed(format!("post {} has no date", id)))?;
        let date = DateTime::parse_from_rfc3339(datetime)
            .map_err(|e| SourceError::Malformed(format!("post {} date {:?}: {}", id, datetime, e)))?
            .with_timezone(&Utc);

        // A reply embeds the quoted post's text block too, skip that one
        let text = element
            .select(&text_selector)
            .find(|el| !inside_reply(*el))
            .map(message_text)
            .unwrap_or_default();

        messages.push(RawMessage {
            id,
            text,
            has_media: element.select(&media_selector).next().is_some(),
            date,
        });
    }

    Ok(messages)
}

fn inside_reply(element: ElementRef) -> bool {
    element.ancestors().filter_map(ElementRef::wrap).any(|a| {
        a.value()
            .has_class("tgme_widget_message_reply", CaseSensitivity::CaseSensitive)
    })
}

/// Text content with `<br>` turned back into newlines.
fn message_text(element: ElementRef) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if el.name() == "br" => out.push('\n'),
            _ => {}
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<html><body>
<section class="tgme_channel_history js-message_history">
  <div class="tgme_widget_message_wrap">
    <div class="tgme_widget_message text_not_supported_wrap js-widget_message" data-post="acme/8">
      <div class="tgme_widget_message_bubble">
        <a class="tgme_widget_message_photo_wrap" href="https://t.me/acme/8"></a>
        <div class="tgme_widget_message_footer">
          <a class="tgme_widget_message_date" href="https://t.me/acme/8"><time datetime="2024-05-01T10:00:00+00:00" class="time">10:00</time></a>
        </div>
      </div>
    </div>
  </div>
  <div class="tgme_widget_message_wrap">
    <div class="tgme_widget_message js-widget_message" data-post="acme/9">
      <div class="tgme_widget_message_bubble">
        <a class="tgme_widget_message_reply" href="https://t.me/acme/2">
          <div class="tgme_widget_message_text js-message_reply_text">quoted</div>
        </a>
        <div class="tgme_widget_message_text js-message_text" dir="auto">New <b>Launch</b>!<br/>See <a href="https://example.com/x">https://example.com/x</a> &amp; more</div>
        <div class="tgme_widget_message_footer">
          <a class="tgme_widget_message_date" href="https://t.me/acme/9"><time datetime="2024-05-01T12:30:00+02:00" class="time">12:30</time></a>
        </div>
      </div>
    </div>
  </div>
</section>
</body></html>
"#;

    #[test]
    fn test_parse_page() {
        let messages = parse_page(PAGE).unwrap();
        assert_eq!(messages.len(), 2);

        let photo = &messages[0];
        assert_eq!(photo.id, 8);
        assert!(photo.has_media);
        assert_eq!(photo.text, "");

        let post = &messages[1];
        assert_eq!(post.id, 9);
        assert!(!post.has_media);
        assert_eq!(post.text, "New Launch!\nSee https://example.com/x & more");
        assert_eq!(post.date.to_rfc3339(), "2024-05-01T10:30:00+00:00");
    }

    #[test]
    fn test_parse_page_rejects_bad_id() {
        let html = r#"<div class="tgme_widget_message" data-post="acme/abc"></div>"#;
        assert!(matches!(parse_page(html), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn test_parse_empty_page() {
        assert!(parse_page("<html><body></body></html>").unwrap().is_empty());
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "42".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(42)));
    }
}
