use std::sync::LazyLock;

use regex::Regex;

const TITLE_MAX_CHARS: usize = 120;

static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static FIRST_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://[^\s)]+").unwrap());
// C0 controls XML 1.0 does not allow; tab, LF and CR are fine.
static XML_ILLEGAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]").unwrap());

/// Removes control characters that would make the document malformed XML.
pub fn strip_control(text: &str) -> String {
    XML_ILLEGAL.replace_all(text, "").into_owned()
}

/// Trim the body and collapse runs of blank lines down to one.
pub fn clean_text(text: &str) -> String {
    let text = strip_control(text);
    BLANK_LINES.replace_all(text.trim(), "\n\n").into_owned()
}

/// First line of already cleaned text, cut to 120 characters.
pub fn title_line(content: &str) -> String {
    content
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

/// First http(s) URL, ending at whitespace or a closing parenthesis.
pub fn extract_first_url(content: &str) -> Option<&str> {
    FIRST_URL.find(content).map(|m| m.as_str())
}

/// Escapes `&`, `<`, `>`, `"` and `'`.
/// Control characters are dropped as well.
pub fn escape(text: &str) -> String {
    html_escape::encode_quoted_attribute(&strip_control(text)).into_owned()
}

/// Escaped body with newlines turned into `<br/>`.
pub fn to_html(content: &str) -> String {
    escape(content).replace('\n', "<br/>")
}
