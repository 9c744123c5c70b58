use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use url::Url;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Content,
    Navigation,
    Download,
    Button,
    Social,
    Media,
    Email,
    Phone,
}

impl LinkType {
    fn priority(self) -> u8 {
        match self {
            LinkType::Content => 1,
            LinkType::Navigation => 2,
            LinkType::Download => 3,
            LinkType::Button => 4,
            LinkType::Social => 5,
            LinkType::Media => 6,
            LinkType::Email => 7,
            LinkType::Phone => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct LinkInfo {
    pub url: String,
    pub text: String,
    pub is_internal: bool,
    pub link_type: LinkType,
}

/// Turns fetched or rendered HTML into classified link records.
pub trait LinkExtractor: Send + Sync {
    fn extract(&self, html: &str, base_url: &str) -> Vec<LinkInfo>;
}

/// Reads `<a href>` anchors.
#[derive(Debug, Clone)]
pub struct AnchorLinkExtractor {
    max_links: usize,
}

impl AnchorLinkExtractor {
    pub fn new(max_links: usize) -> Self {
        Self { max_links }
    }
}

impl Default for AnchorLinkExtractor {
    fn default() -> Self {
        Self::new(100)
    }
}

const DOWNLOAD_EXT: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".rar", ".tar", ".gz", ".mp3", ".mp4", ".avi",
];
const MEDIA_EXT: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".mov"];
const SOCIAL_DOMAINS: &[&str] = &[
    "facebook.com", "twitter.com", "x.com/", "linkedin.com", "instagram.com", "youtube.com", "github.com", "reddit.com",
];
const NAV_WORDS: &[&str] = &[
    "menu", "nav", "home", "about", "contact", "services", "products", "blog", "news", "help", "support",
];
const CONTENT_WORDS: &[&str] = &["read more", "continue reading", "full article", "details", "learn more", "view", "see"];

impl LinkExtractor for AnchorLinkExtractor {
    fn extract(&self, html: &str, base_url: &str) -> Vec<LinkInfo> {
        let Ok(base) = Url::parse(base_url) else {
            return Vec::new();
        };
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        let base_host = base.host_str().unwrap_or("").to_ascii_lowercase();
        let document = Html::parse_document(html);

        let mut seen = HashSet::new();
        let mut links: Vec<LinkInfo> = Vec::new();
        for anchor in document.select(&selector) {
            let href = anchor.value().attr("href").unwrap_or("").trim();
            if href.is_empty() || href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
                continue;
            }
            let Ok(absolute) = base.join(href) else {
                continue;
            };
            let url = absolute.to_string();
            if !seen.insert(url.clone()) {
                continue;
            }

            let text = anchor_text(&anchor, href);
            let host = absolute.host_str().unwrap_or("").to_ascii_lowercase();
            let is_internal =
                !host.is_empty() && (host == base_host || host.ends_with(&format!(".{base_host}")));
            let link_type = classify(&url, &text, &anchor);
            links.push(LinkInfo {
                url,
                text,
                is_internal,
                link_type,
            });
        }

        // Stable sort keeps document order within each bucket.
        links.sort_by_key(|l| (!l.is_internal, l.link_type.priority()));
        links.truncate(self.max_links);
        links
    }
}

fn anchor_text(anchor: &ElementRef<'_>, href: &str) -> String {
    let text = anchor.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let text = if text.is_empty() {
        anchor.value().attr("title").unwrap_or("").trim().to_string()
    } else {
        text
    };
    let text = if text.is_empty() { href.to_string() } else { text };
    text.chars().take(200).collect()
}

fn classify(url: &str, text: &str, anchor: &ElementRef<'_>) -> LinkType {
    let url = url.to_ascii_lowercase();
    let text = text.to_lowercase();

    if DOWNLOAD_EXT.iter().any(|ext| url.contains(ext)) {
        return LinkType::Download;
    }
    if MEDIA_EXT.iter().any(|ext| url.contains(ext)) {
        return LinkType::Media;
    }
    if url.starts_with("mailto:") {
        return LinkType::Email;
    }
    if url.starts_with("tel:") {
        return LinkType::Phone;
    }
    if SOCIAL_DOMAINS.iter().any(|d| url.contains(d)) {
        return LinkType::Social;
    }
    if NAV_WORDS.iter().any(|w| text.contains(w)) {
        return LinkType::Navigation;
    }
    if CONTENT_WORDS.iter().any(|w| text.contains(w)) {
        return LinkType::Content;
    }

    let classes = anchor.value().attr("class").unwrap_or("").to_ascii_lowercase();
    if classes.contains("button") || classes.contains("btn") {
        return LinkType::Button;
    }
    if classes.contains("nav") || classes.contains("menu") {
        return LinkType::Navigation;
    }
    LinkType::Content
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r##"<html><body>
        <a href="https://other.org/story">A story elsewhere</a>
        <a href="/about">About us</a>
        <a href="#top">Top</a>
        <a href="javascript:void(0)">Click</a>
        <a href="/docs/guide.pdf">Guide</a>
        <a href="mailto:team@example.com">Write to us</a>
        <a href="/about">About again</a>
        <a href="https://blog.example.com/post/1" class="btn primary">Go</a>
        <a href="/img/cat.png" title="Cat picture"></a>
        <a href="https://github.com/example">Code</a>
    </body></html>"##;

    #[test]
    fn extracts_classifies_and_orders_links() {
        let links = AnchorLinkExtractor::default().extract(PAGE, "https://example.com/index.html");
        let summary: Vec<(&str, bool, LinkType)> =
            links.iter().map(|l| (l.url.as_str(), l.is_internal, l.link_type)).collect();
        assert_eq!(
            summary,
            vec![
                ("https://example.com/about", true, LinkType::Navigation),
                ("https://example.com/docs/guide.pdf", true, LinkType::Download),
                ("https://blog.example.com/post/1", true, LinkType::Button),
                ("https://example.com/img/cat.png", true, LinkType::Media),
                ("https://other.org/story", false, LinkType::Content),
                ("https://github.com/example", false, LinkType::Social),
                ("mailto:team@example.com", false, LinkType::Email),
            ]
        );
    }

    #[test]
    fn falls_back_to_title_for_text() {
        let links = AnchorLinkExtractor::default().extract(PAGE, "https://example.com/");
        let cat = links.iter().find(|l| l.url.ends_with("cat.png")).unwrap();
        assert_eq!(cat.text, "Cat picture");
    }

    #[test]
    fn caps_link_count_and_tolerates_bad_base() {
        assert_eq!(AnchorLinkExtractor::new(2).extract(PAGE, "https://example.com/").len(), 2);
        assert!(AnchorLinkExtractor::default().extract(PAGE, "not a url").is_empty());
    }
}
