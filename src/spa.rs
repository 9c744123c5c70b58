//! Single-page-application detection rubric.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::html;

/// Score at or above which a page is treated as client-rendered.
pub const SPA_THRESHOLD: u32 = 2;

/// Score at or above which the extra browser strategies run.
pub const ULTRA_THRESHOLD: u32 = 4;

const COMPLEX_HOST_PREFIXES: &[&str] = &["app.", "dashboard.", "admin."];

/// Runs in the page and reports the raw signals as a JSON string.
pub const SPA_SIGNALS_SCRIPT: &str = r#"
(() => {
    const has = (sel) => { try { return !!document.querySelector(sel); } catch (e) { return false; } };
    const body = document.body ? (document.body.innerText || document.body.textContent || '') : '';
    const lowered = body.toLowerCase();
    const placeholders = ['javascript is required', 'please enable javascript', 'this app requires javascript',
        'javascript wird benötigt', 'loading...', 'wird geladen...'];
    const frameworks = [];
    if (window.React || has('[data-reactroot]') || has('#__next') || window.__NEXT_DATA__) frameworks.push('react');
    if (window.Vue || window.__VUE__ || has('[data-v-app]') || window.__NUXT__) frameworks.push('vue');
    if (window.angular || window.ng || has('[ng-version]') || has('[ng-app]') || has('app-root')) frameworks.push('angular');
    if (window.Ember || has('.ember-view')) frameworks.push('ember');
    if (window.__svelte || has('[class*="svelte-"]')) frameworks.push('svelte');
    return JSON.stringify({
        frameworks: frameworks,
        history_routing: !!(window.history && window.history.pushState) && frameworks.length > 0,
        dynamic_markers: has('[data-testid]') || has('[data-cy]') || has('.loading') || has('.spinner'),
        root_container: has('#app') || has('#root') || has('.app'),
        title: document.title || '',
        placeholder: placeholders.some((p) => lowered.includes(p)),
        state_management: !!(window.Redux || window.Vuex || window.MobX || window.__REDUX_STORE__
            || window.__APOLLO_STATE__ || window.__INITIAL_STATE__),
        text_length: body.trim().length,
        host: window.location.hostname || ''
    });
})()
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpaSignals {
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub history_routing: bool,
    #[serde(default)]
    pub dynamic_markers: bool,
    #[serde(default)]
    pub root_container: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub placeholder: bool,
    #[serde(default)]
    pub state_management: bool,
    /// Visible body text length when the signals were read.
    #[serde(default)]
    pub text_length: usize,
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaAssessment {
    pub score: u32,
    pub is_spa: bool,
    pub fired: Vec<&'static str>,
    pub ultra_score: u32,
    /// Heavily client-rendered page that resists the ordinary strategies.
    pub ultra_complex: bool,
}

static HTML_FRAMEWORK_MARKERS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("react", Regex::new(r#"(?i)data-reactroot|id=["']__next["']|__NEXT_DATA__|react(-dom)?(\.production)?(\.min)?\.js"#).unwrap()),
        ("vue", Regex::new(r#"(?i)data-v-app|data-v-[0-9a-f]{6,}|__NUXT__|vue(\.runtime)?(\.global)?(\.prod)?(\.min)?\.js"#).unwrap()),
        ("angular", Regex::new(r#"(?i)ng-version=|ng-app|<app-root"#).unwrap()),
        ("ember", Regex::new(r#"(?i)ember-view|ember(\.min)?\.js"#).unwrap()),
        ("svelte", Regex::new(r#"(?i)class=["'][^"']*svelte-[a-z0-9]+"#).unwrap()),
    ]
});
static HTML_HISTORY: Lazy<Regex> = Lazy::new(|| Regex::new(r"history\.(pushState|replaceState)").unwrap());
static HTML_DYNAMIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)data-testid=|data-cy=|class=["'][^"']*\b(loading|spinner)\b"#).unwrap());
static HTML_ROOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)id=["'](app|root)["']|class=["']app["']"#).unwrap());
static HTML_STATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__REDUX_STORE__|__APOLLO_STATE__|__INITIAL_STATE__|\bVuex\b|\bMobX\b").unwrap());

impl SpaSignals {
    /// Same signals, read from markup when the page cannot be read live.
    pub fn from_html(html: &str) -> Self {
        let frameworks = HTML_FRAMEWORK_MARKERS
            .iter()
            .filter(|(_, re)| re.is_match(html))
            .map(|(name, _)| name.to_string())
            .collect();
        Self {
            frameworks,
            history_routing: HTML_HISTORY.is_match(html),
            dynamic_markers: HTML_DYNAMIC.is_match(html),
            root_container: HTML_ROOT.is_match(html),
            title: String::new(),
            placeholder: html::looks_like_placeholder(html),
            state_management: HTML_STATE.is_match(html),
            text_length: html::regex_strip(html).chars().count(),
            host: String::new(),
        }
    }

    pub fn assess(&self) -> SpaAssessment {
        let mut score = 0;
        let mut fired = Vec::new();
        for name in ["react", "vue", "angular", "ember", "svelte"] {
            if self.frameworks.iter().any(|f| f == name) {
                score += 2;
                fired.push(name);
            }
        }
        if self.history_routing {
            score += 1;
            fired.push("history_routing");
        }
        if self.dynamic_markers {
            score += 1;
            fired.push("dynamic_markers");
        }
        if self.root_container {
            score += 1;
            fired.push("root_container");
        }
        let ultra_score = self.ultra_score();
        SpaAssessment {
            score,
            is_spa: score >= SPA_THRESHOLD,
            fired,
            ultra_score,
            ultra_complex: ultra_score >= ULTRA_THRESHOLD,
        }
    }

    fn ultra_score(&self) -> u32 {
        let mut score = 0;
        if self.placeholder {
            score += 3;
        }
        let routed_framework = self.history_routing && self.frameworks.iter().any(|f| f == "react" || f == "vue");
        if routed_framework {
            score += 2;
        }
        if self.state_management {
            score += 2;
        }
        if self.text_length > 0 && self.text_length < 500 {
            score += 2;
        }
        let host = self.host.to_ascii_lowercase();
        if COMPLEX_HOST_PREFIXES.iter().any(|p| host.starts_with(p)) {
            score += 1;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_marker_alone_crosses_threshold() {
        let signals = SpaSignals {
            frameworks: vec!["react".into()],
            ..Default::default()
        };
        let assessment = signals.assess();
        assert!(assessment.is_spa);
        assert_eq!(assessment.fired, vec!["react"]);
    }

    #[test]
    fn single_weak_signal_is_not_enough() {
        let signals = SpaSignals {
            root_container: true,
            ..Default::default()
        };
        assert!(!signals.assess().is_spa);
    }

    #[test]
    fn reads_signals_from_markup() {
        let html = r#"<html><body><div id="root"></div>
            <script src="/static/react-dom.production.min.js"></script></body></html>"#;
        let signals = SpaSignals::from_html(html);
        assert_eq!(signals.frameworks, vec!["react".to_string()]);
        assert!(signals.root_container);
        assert_eq!(signals.assess().score, 3);
    }

    #[test]
    fn plain_article_is_not_spa() {
        let html = "<html><body><article><p>Hello there.</p></article></body></html>";
        assert!(!SpaSignals::from_html(html).assess().is_spa);
    }

    #[test]
    fn signal_json_deserializes() {
        let raw = r#"{"frameworks":["vue"],"history_routing":true,"dynamic_markers":false,"root_container":true,"title":"Shop"}"#;
        let signals: SpaSignals = serde_json::from_str(raw).unwrap();
        assert_eq!(signals.assess().score, 4);
    }

    #[test]
    fn placeholder_on_a_thin_app_host_is_ultra_complex() {
        let signals = SpaSignals {
            placeholder: true,
            text_length: 40,
            host: "app.example.com".into(),
            ..Default::default()
        };
        let assessment = signals.assess();
        assert_eq!(assessment.ultra_score, 6);
        assert!(assessment.ultra_complex);
    }

    #[test]
    fn ordinary_spa_is_not_ultra_complex() {
        let signals = SpaSignals {
            frameworks: vec!["react".into()],
            root_container: true,
            text_length: 3200,
            host: "news.example.com".into(),
            ..Default::default()
        };
        let assessment = signals.assess();
        assert!(assessment.is_spa);
        assert!(!assessment.ultra_complex);
    }
}
