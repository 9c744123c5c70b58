//! Ordered text strategies over a rendered DOM snapshot.
//!
//! Each strategy is a pure function from the snapshot to text or nothing.
//! They run lazily in order and stop at the first one producing substantial
//! content; the rest are never evaluated. Ultra-complex pages get a second
//! list that mines embedded data, page state, shadow roots and frames.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::html;
use crate::model::{ExtractionMethod, OutputShape};

pub struct Snapshot<'a> {
    pub html: &'a str,
    pub url: &'a Url,
    pub shape: OutputShape,
    /// Present only for ultra-complex pages; enables [`ULTRA_STRATEGIES`].
    pub extras: Option<&'a LiveExtras>,
}

/// Collects what only the live page can see. Returns a JSON string.
pub const LIVE_EXTRAS_SCRIPT: &str = r#"
(() => {
    const shadow = [];
    const visit = (root) => {
        for (const el of root.querySelectorAll('*')) {
            if (el.shadowRoot) {
                const text = (el.shadowRoot.textContent || '').trim();
                if (text.length > 10) shadow.push(text);
                visit(el.shadowRoot);
            }
        }
    };
    try { visit(document); } catch (e) {}

    const frames = [];
    for (const frame of document.querySelectorAll('iframe')) {
        try {
            const doc = frame.contentDocument;
            const text = doc && doc.body ? (doc.body.innerText || '').trim() : '';
            if (text.length > 50) frames.push(text);
        } catch (e) {}
    }

    const state = [];
    const take = (value) => {
        try { if (value && typeof value === 'object') state.push(JSON.parse(JSON.stringify(value))); } catch (e) {}
    };
    try { if (window.__REDUX_STORE__ && window.__REDUX_STORE__.getState) take(window.__REDUX_STORE__.getState()); } catch (e) {}
    for (const key of ['__INITIAL_STATE__', '__APOLLO_STATE__', '__NUXT__', 'appState', 'applicationState']) {
        take(window[key]);
    }
    return JSON.stringify({ shadow: shadow, frames: frames, state: state });
})()
"#;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LiveExtras {
    /// Text of each open shadow root.
    #[serde(default)]
    pub shadow: Vec<String>,
    /// Body text of each same-origin frame.
    #[serde(default)]
    pub frames: Vec<String>,
    /// Serialisable application state objects.
    #[serde(default)]
    pub state: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyText {
    pub text: String,
    pub plain: String,
}

impl StrategyText {
    fn plain(text: String) -> Self {
        Self {
            plain: text.clone(),
            text,
        }
    }

    fn chars(&self) -> usize {
        self.plain.chars().count()
    }
}

type StrategyFn = fn(&Snapshot<'_>) -> Option<StrategyText>;

pub const STRATEGIES: &[(ExtractionMethod, StrategyFn)] = &[
    (ExtractionMethod::Structured, structured),
    (ExtractionMethod::MainSelectors, main_selectors),
    (ExtractionMethod::ReadableFiltered, readable_filtered),
    (ExtractionMethod::DomFallback, dom_fallback),
];

pub const ULTRA_STRATEGIES: &[(ExtractionMethod, StrategyFn)] = &[
    (ExtractionMethod::EmbeddedData, embedded_data),
    (ExtractionMethod::StateGlobals, state_globals),
    (ExtractionMethod::ShadowDom, shadow_dom),
    (ExtractionMethod::Frames, frames),
    (ExtractionMethod::TextMining, text_mining),
];

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyRun {
    /// Longest text seen so far, or the first substantial one.
    pub best: Option<(ExtractionMethod, StrategyText)>,
    /// Methods evaluated, in order.
    pub attempted: Vec<ExtractionMethod>,
    /// Whether `best` reached the substantial-content length.
    pub satisfied: bool,
}

pub fn run_strategies(snapshot: &Snapshot<'_>, min_chars: usize) -> StrategyRun {
    let ultra: &[(ExtractionMethod, StrategyFn)] = if snapshot.extras.is_some() { ULTRA_STRATEGIES } else { &[] };
    run_in_order(snapshot, min_chars, STRATEGIES.iter().chain(ultra))
}

fn run_in_order<'s>(
    snapshot: &Snapshot<'_>,
    min_chars: usize,
    strategies: impl Iterator<Item = &'s (ExtractionMethod, StrategyFn)>,
) -> StrategyRun {
    let mut run = StrategyRun {
        best: None,
        attempted: Vec::new(),
        satisfied: false,
    };

    for (method, strategy) in strategies {
        run.attempted.push(*method);
        let Some(found) = strategy(snapshot) else {
            continue;
        };
        let chars = found.chars();
        if chars >= min_chars {
            run.best = Some((*method, found));
            run.satisfied = true;
            return run;
        }
        let better = run.best.as_ref().map_or(chars > 0, |(_, b)| chars > b.chars());
        if better {
            run.best = Some((*method, found));
        }
    }
    run
}

fn structured(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let s = html::structured_extract(snapshot.html, snapshot.url)?;
    Some(StrategyText {
        text: s.shaped(snapshot.shape).to_string(),
        plain: s.text,
    })
}

const MAIN_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role='main']",
    "#content",
    "#main",
    ".content",
    ".main-content",
    ".post-content",
    ".entry-content",
    ".article-body",
];

fn main_selectors(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let document = Html::parse_document(snapshot.html);
    MAIN_SELECTORS
        .iter()
        .filter_map(|sel| Selector::parse(sel).ok())
        .filter_map(|sel| document.select(&sel).next().map(|el| html::html_to_text(&el.html())))
        .filter(|text| !text.is_empty())
        .max_by_key(|text| text.chars().count())
        .map(StrategyText::plain)
}

const EXCLUDED_TAGS: &[&str] = &["nav", "header", "footer", "aside", "script", "style", "noscript", "template", "form"];
const EXCLUDED_MARKERS: &[&str] = &[
    "sidebar", "navigation", "menu", "ads", "advert", "social", "share", "comment", "cookie", "banner", "popup",
];
const TEXT_BLOCKS: &str = "h1, h2, h3, h4, h5, h6, p, li, blockquote, pre, td, dd, figcaption";

fn is_excluded(el: &ElementRef<'_>) -> bool {
    let value = el.value();
    if EXCLUDED_TAGS.contains(&value.name()) {
        return true;
    }
    if value.attr("hidden").is_some() || value.attr("aria-hidden") == Some("true") {
        return true;
    }
    if let Some(style) = value.attr("style") {
        let style = style.replace(' ', "").to_ascii_lowercase();
        if style.contains("display:none") || style.contains("visibility:hidden") {
            return true;
        }
    }
    let markers = format!(
        "{} {}",
        value.attr("class").unwrap_or(""),
        value.attr("id").unwrap_or("")
    )
    .to_ascii_lowercase();
    markers
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .any(|token| EXCLUDED_MARKERS.iter().any(|m| token.starts_with(m)))
}

fn readable_filtered(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let document = Html::parse_document(snapshot.html);
    let blocks = Selector::parse(TEXT_BLOCKS).ok()?;

    let mut lines: Vec<String> = Vec::new();
    for el in document.select(&blocks) {
        let ancestors: Vec<ElementRef<'_>> = el.ancestors().filter_map(ElementRef::wrap).collect();
        if is_excluded(&el) || ancestors.iter().any(is_excluded) {
            continue;
        }
        // Nested blocks are read through their outermost block.
        if ancestors.iter().any(|a| blocks.matches(a)) {
            continue;
        }
        let text = el.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.chars().count() >= 10 {
            lines.push(text);
        }
    }

    if lines.is_empty() {
        return None;
    }
    Some(StrategyText::plain(lines.join("\n\n")))
}

fn dom_fallback(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let document = Html::parse_document(snapshot.html);
    let body = Selector::parse("body").ok()?;
    let markup = document
        .select(&body)
        .next()
        .map(|el| el.html())
        .unwrap_or_else(|| snapshot.html.to_string());
    let text = html::html_to_text(&markup);
    let text = if text.is_empty() { html::regex_strip(&markup) } else { text };
    (!text.is_empty()).then(|| StrategyText::plain(text))
}

static SCRIPT_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\{[^{}]*"[^"]*"[^{}]*\}"#).unwrap());

const EMBEDDED_SCRIPTS: &str = "script#__NEXT_DATA__, script#__NUXT_DATA__, script[type='application/ld+json'], \
                                script[type='application/json'], script[type='json'], script[id*='topic']";

/// Accumulates human-readable strings, dropping repeats.
#[derive(Default)]
struct Harvest {
    seen: HashSet<String>,
    lines: Vec<String>,
}

impl Harvest {
    fn push(&mut self, raw: &str, min_chars: usize) {
        let text = if raw.contains('<') {
            html::regex_strip(raw)
        } else {
            html::normalize_whitespace(raw)
        };
        if text.chars().count() < min_chars || !self.seen.insert(text.clone()) {
            return;
        }
        self.lines.push(text);
    }

    /// Walks a JSON value and keeps strings that read like prose.
    fn push_json(&mut self, value: &Value) {
        match value {
            Value::String(s) if is_prose(s) => self.push(s, 20),
            Value::Array(items) => items.iter().for_each(|v| self.push_json(v)),
            Value::Object(map) => map.values().for_each(|v| self.push_json(v)),
            _ => {}
        }
    }

    fn finish(self) -> Option<StrategyText> {
        (!self.lines.is_empty()).then(|| StrategyText::plain(self.lines.join("\n\n")))
    }
}

fn is_prose(s: &str) -> bool {
    let s = s.trim();
    s.split_whitespace().count() >= 4 && !s.starts_with("http") && !s.starts_with('{') && !s.starts_with("function")
}

/// Parses script text as JSON, tolerating comment and CDATA wrappers.
fn parse_embedded(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn embedded_data(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let document = Html::parse_document(snapshot.html);
    let scripts = Selector::parse(EMBEDDED_SCRIPTS).ok()?;
    let mut harvest = Harvest::default();
    for script in document.select(&scripts) {
        if let Some(value) = parse_embedded(&script.text().collect::<String>()) {
            harvest.push_json(&value);
        }
    }
    harvest.finish()
}

fn state_globals(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let mut harvest = Harvest::default();
    snapshot.extras?.state.iter().for_each(|v| harvest.push_json(v));
    harvest.finish()
}

fn shadow_dom(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let mut harvest = Harvest::default();
    snapshot.extras?.shadow.iter().for_each(|t| harvest.push(t, 10));
    harvest.finish()
}

fn frames(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let mut harvest = Harvest::default();
    snapshot.extras?.frames.iter().for_each(|t| harvest.push(t, 50));
    harvest.finish()
}

/// Last resort: JSON fragments in inline scripts, long data attributes, and comments.
fn text_mining(snapshot: &Snapshot<'_>) -> Option<StrategyText> {
    let document = Html::parse_document(snapshot.html);
    let mut harvest = Harvest::default();

    if let Ok(scripts) = Selector::parse("script:not([src])") {
        for script in document.select(&scripts) {
            let body = script.text().collect::<String>();
            for fragment in SCRIPT_OBJECT.find_iter(&body) {
                if let Ok(value) = serde_json::from_str::<Value>(fragment.as_str()) {
                    harvest.push_json(&value);
                }
            }
        }
    }

    for node in document.root_element().descendants() {
        match node.value() {
            Node::Element(el) => el
                .attrs()
                .filter(|(name, value)| name.starts_with("data-") && is_prose(value))
                .for_each(|(_, value)| harvest.push(value, 10)),
            Node::Comment(comment) => harvest.push(comment, 20),
            _ => {}
        }
    }
    harvest.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn url() -> Url {
        Url::parse("https://shop.example.com/item").unwrap()
    }

    const CLUTTERED: &str = r#"<html><body>
        <nav><ul><li>Home page link</li><li>Products and more</li></ul></nav>
        <div class="sidebar"><p>Sidebar promotion text here</p></div>
        <div class="product"><h2>Walnut desk organiser</h2>
            <p>Hand finished walnut with three compartments.</p>
            <p hidden>Hidden shipping matrix text</p>
            <p>Ok</p></div>
        <div class="share-buttons"><p>Share this on every network</p></div>
        <footer><p>Copyright and legal text</p></footer>
    </body></html>"#;

    #[test]
    fn readable_filter_drops_chrome_and_short_fragments() {
        let snapshot = Snapshot {
            html: CLUTTERED,
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        };
        let found = readable_filtered(&snapshot).unwrap();
        assert_eq!(
            found.plain,
            "Walnut desk organiser\n\nHand finished walnut with three compartments."
        );
    }

    #[test]
    fn main_selectors_prefer_longest_container() {
        let html = r#"<html><body><main><p>Short main.</p></main>
            <article><p>The article body is the longer of the two containers here.</p></article></body></html>"#;
        let snapshot = Snapshot {
            html,
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        };
        let found = main_selectors(&snapshot).unwrap();
        assert!(found.plain.contains("longer of the two"));
    }

    fn nothing(_: &Snapshot<'_>) -> Option<StrategyText> {
        None
    }

    fn long_text(_: &Snapshot<'_>) -> Option<StrategyText> {
        Some(StrategyText::plain("walnut ".repeat(100)))
    }

    fn must_not_run(_: &Snapshot<'_>) -> Option<StrategyText> {
        panic!("strategy evaluated after a substantial result");
    }

    #[test]
    fn stops_at_first_substantial_strategy() {
        let order: [(ExtractionMethod, StrategyFn); 4] = [
            (ExtractionMethod::Structured, nothing),
            (ExtractionMethod::MainSelectors, long_text),
            (ExtractionMethod::ReadableFiltered, must_not_run),
            (ExtractionMethod::DomFallback, must_not_run),
        ];
        let snapshot = Snapshot {
            html: "<html></html>",
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        };
        let run = run_in_order(&snapshot, 500, order.iter());
        assert!(run.satisfied);
        assert_eq!(run.best.unwrap().0, ExtractionMethod::MainSelectors);
        assert_eq!(
            run.attempted,
            vec![ExtractionMethod::Structured, ExtractionMethod::MainSelectors]
        );
    }

    #[test]
    fn keeps_best_when_nothing_is_substantial() {
        let snapshot = Snapshot {
            html: CLUTTERED,
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        };
        let run = run_strategies(&snapshot, 5000);
        assert!(!run.satisfied);
        assert_eq!(run.attempted.len(), STRATEGIES.len());
        assert!(run.best.is_some());
    }

    fn ultra_run(html: &str, extras: &LiveExtras) -> StrategyRun {
        let snapshot = Snapshot {
            html,
            url: &url(),
            shape: OutputShape::Text,
            extras: Some(extras),
        };
        run_strategies(&snapshot, 120)
    }

    const SHELL: &str = "<html><body><div id=\"root\"><p>Loading...</p></div></body></html>";

    const STORY: &str = "The walnut desk organiser is cut from a single board and oiled by hand. \
                         Each piece is signed by the joiner who finished it in the workshop.";

    #[test]
    fn extra_strategies_only_run_for_ultra_complex_pages() {
        let snapshot = Snapshot {
            html: SHELL,
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        };
        let run = run_strategies(&snapshot, 120);
        assert_eq!(run.attempted.len(), STRATEGIES.len());

        let run = ultra_run(SHELL, &LiveExtras::default());
        assert_eq!(run.attempted.len(), STRATEGIES.len() + ULTRA_STRATEGIES.len());
        assert!(!run.satisfied);
    }

    #[test]
    fn embedded_next_data_is_read() {
        let html = format!(
            r#"<html><body><div id="__next"></div>
            <script id="__NEXT_DATA__" type="application/json">{{"props":{{"pageProps":{{"item":{{"story":"{STORY}","sku":"WD-4"}}}}}}}}</script>
            </body></html>"#
        );
        let run = ultra_run(&html, &LiveExtras::default());
        let (method, found) = run.best.unwrap();
        assert!(run.satisfied);
        assert_eq!(method, ExtractionMethod::EmbeddedData);
        assert_eq!(found.plain, STORY.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    #[test]
    fn ld_json_wrapped_in_comments_is_read() {
        let html = format!(
            "<html><body><script type=\"application/ld+json\"><!--{{\"@type\":\"Product\",\"description\":\"<p>{STORY}</p>\"}}--></script></body></html>"
        );
        let found = embedded_data(&Snapshot {
            html: &html,
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        })
        .unwrap();
        assert!(found.plain.starts_with("The walnut desk organiser"));
        assert!(!found.plain.contains("<p>"));
    }

    #[test]
    fn application_state_is_mined() {
        let extras = LiveExtras {
            state: vec![serde_json::json!({
                "catalogue": {"entries": [{"id": 7, "blurb": STORY}, {"id": 8, "blurb": STORY}]},
                "session": "token-abc"
            })],
            ..Default::default()
        };
        let run = ultra_run(SHELL, &extras);
        let (method, found) = run.best.unwrap();
        assert_eq!(method, ExtractionMethod::StateGlobals);
        assert_eq!(found.plain.matches("walnut desk organiser").count(), 1);
        assert!(!found.plain.contains("token-abc"));
    }

    #[test]
    fn shadow_roots_are_read() {
        let extras = LiveExtras {
            shadow: vec![STORY.to_string(), "tiny".to_string()],
            ..Default::default()
        };
        let run = ultra_run(SHELL, &extras);
        let (method, found) = run.best.unwrap();
        assert_eq!(method, ExtractionMethod::ShadowDom);
        assert!(!found.plain.contains("tiny"));
        assert_eq!(
            run.attempted.last(),
            Some(&ExtractionMethod::ShadowDom)
        );
    }

    #[test]
    fn same_origin_frames_are_read() {
        let extras = LiveExtras {
            frames: vec![format!("  {STORY}\n\n  ")],
            ..Default::default()
        };
        let run = ultra_run(SHELL, &extras);
        let (method, _) = run.best.unwrap();
        assert_eq!(method, ExtractionMethod::Frames);
    }

    #[test]
    fn text_mining_reads_fragments_attributes_and_comments() {
        let html = format!(
            r#"<html><body><div id="app" data-summary="Walnut organisers ship in recycled card boxes.">
            <!-- Catalogue note: every organiser ships with a care card and spare felt pads. -->
            <script>window.boot({{"headline":"{STORY}"}});</script></div></body></html>"#
        );
        let found = text_mining(&Snapshot {
            html: &html,
            url: &url(),
            shape: OutputShape::Text,
            extras: None,
        })
        .unwrap();
        assert!(found.plain.contains("signed by the joiner"));
        assert!(found.plain.contains("recycled card boxes"));
        assert!(found.plain.contains("spare felt pads"));
    }
}
