//! HTML to text helpers shared by the static and browser paths.

use std::io::Cursor;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::model::OutputShape;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ]
});

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_USER_AGENT)
}

static BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template|svg)\b[^>]*>.*?</(script|style|noscript|template|svg)\s*>")
        .unwrap()
});
static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static BREAK_TAGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*(br|/p|/div|/li|/h[1-6]|/tr|/section|/article)\b[^>]*>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n(\s*\n)+").unwrap());

/// Output of readability-style main-content extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Structured {
    pub text: String,
    pub markdown: String,
}

impl Structured {
    pub fn shaped(&self, shape: OutputShape) -> &str {
        match shape {
            OutputShape::Markdown => &self.markdown,
            OutputShape::Text | OutputShape::Raw => &self.text,
        }
    }
}

/// Main-content extraction keeping headings, lists and paragraph breaks.
pub fn structured_extract(html: &str, url: &Url) -> Option<Structured> {
    let mut reader = Cursor::new(html.as_bytes());
    let product = match readability::extractor::extract(&mut reader, url) {
        Ok(product) => product,
        Err(e) => {
            debug!(url = %url, error = %e, "readability extraction failed");
            return None;
        }
    };

    let text = normalize_whitespace(&product.text);
    let markdown = match htmd::convert(&product.content) {
        Ok(md) => normalize_whitespace(&md),
        Err(e) => {
            debug!(url = %url, error = %e, "markdown conversion failed, using plain text");
            text.clone()
        }
    };

    if text.is_empty() && markdown.is_empty() {
        return None;
    }
    Some(Structured { text, markdown })
}

/// Generic HTML-to-text rendering in reading order.
pub fn html_to_text(html: &str) -> String {
    let stripped = BLOCK_TAGS.replace_all(html, "");
    normalize_whitespace(&html2text::from_read(Cursor::new(stripped.as_bytes()), 120))
}

/// Last resort: drop every tag with regexes and decode the common entities.
pub fn regex_strip(html: &str) -> String {
    let text = BLOCK_TAGS.replace_all(html, " ");
    let text = COMMENTS.replace_all(&text, " ");
    let text = BREAK_TAGS.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, " ");
    normalize_whitespace(&decode_entities(&text))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Collapses runs of spaces and blank lines, trims every line.
pub fn normalize_whitespace(text: &str) -> String {
    let collapsed = SPACES.replace_all(text, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    BLANK_LINES.replace_all(&joined, "\n\n").trim().to_string()
}

pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Elements that error and challenge templates commonly carry.
pub fn error_marker_count(html: &str) -> usize {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(
        ".error, #error, .not-found, .forbidden, .blocked, .captcha, .challenge, #challenge-form, #cf-wrapper",
    ) else {
        return 0;
    };
    document.select(&selector).count()
}

/// Visible text in the first part of a document, used to spot placeholder pages.
pub fn looks_like_placeholder(html: &str) -> bool {
    const PLACEHOLDERS: &[&str] = &[
        "javascript is required",
        "please enable javascript",
        "you need to enable javascript",
        "loading...",
        "loading…",
    ];
    let text = regex_strip(html).to_lowercase();
    text.chars().count() < 400 && PLACEHOLDERS.iter().any(|p| text.contains(p))
}
