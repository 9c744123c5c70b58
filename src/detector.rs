//! Error and bot-challenge page detection.
//!
//! Detection is a rubric: each signal has a name and a weight, fired weights
//! are summed, and the sum is compared against a threshold. The verdict does
//! not reject anything by itself; the orchestrator decides what to do with it.

use std::cmp::Reverse;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    ServerError,
    Challenge,
    Generic,
}

impl ErrorKind {
    /// Status reported for content classified as this kind.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::ServerError => 500,
            ErrorKind::Challenge => 503,
            ErrorKind::Generic => 422,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Challenge => "challenge",
            ErrorKind::Generic => "error_page",
        }
    }
}

struct PhraseSet {
    kind: ErrorKind,
    phrases: &'static [&'static str],
}

const PHRASE_SETS: &[PhraseSet] = &[
    PhraseSet {
        kind: ErrorKind::NotFound,
        phrases: &[
            "page not found", "404 not found", "not found", "404 error",
            "seite nicht gefunden", "nicht gefunden",
            "page introuvable", "introuvable", "page non trouvée",
            "página no encontrada", "no encontrada", "no encontrado",
            "pagina non trovata", "non trovata", "non trovato",
            "pagina não encontrada", "não encontrada",
            "pagina niet gevonden", "niet gevonden",
        ],
    },
    PhraseSet {
        kind: ErrorKind::Forbidden,
        phrases: &[
            "access denied", "403 forbidden", "forbidden", "access restricted", "blocked by",
            "zugriff verweigert", "zugang verweigert", "accès refusé", "acceso denegado",
            "accesso negato", "acesso negado", "toegang geweigerd",
        ],
    },
    PhraseSet {
        kind: ErrorKind::ServerError,
        phrases: &[
            "internal server error", "500 error", "server error", "bad gateway", "502 error",
            "503 error", "service unavailable", "interner serverfehler", "erreur interne du serveur",
            "error interno del servidor", "errore interno del server",
        ],
    },
    PhraseSet {
        kind: ErrorKind::Challenge,
        phrases: &[
            "checking your browser", "verify you are human", "ddos protection", "security check",
            "ray id", "cloudflare", "captcha", "enable javascript and cookies",
            "überprüfung ihres browsers", "bestätigen sie, dass sie ein mensch sind",
            "vérification de votre navigateur", "vérifiez que vous êtes humain",
            "verificando tu navegador", "verifica che tu sia umano",
        ],
    },
];

const TITLE_INDICATORS: &[&str] = &[
    "404", "403", "500", "502", "503", "not found", "access denied", "forbidden", "error",
    "blocked", "captcha", "challenge", "just a moment", "attention required",
];

const SHORT_BODY_WORDS: &[&str] = &["error", "not found", "forbidden", "denied", "blocked", "fehler", "erreur"];

static STATUS_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(40[0-9]|5[0-9]{2})\b").unwrap());

/// What the detector looks at. Title and DOM markers are only known on the browser path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorInput<'a> {
    pub text: &'a str,
    pub title: Option<&'a str>,
    /// Number of elements matching error/challenge selectors in the DOM.
    pub dom_markers: usize,
}

impl<'a> DetectorInput<'a> {
    pub fn text(text: &'a str) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ErrorVerdict {
    pub is_error: bool,
    pub confidence: f64,
    pub kind: Option<ErrorKind>,
    pub signals: Vec<String>,
}

impl ErrorVerdict {
    pub fn clean() -> Self {
        Self {
            is_error: false,
            confidence: 0.0,
            kind: None,
            signals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorPageDetector {
    threshold: f64,
    short_body_chars: usize,
    long_body_chars: usize,
}

impl Default for ErrorPageDetector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ErrorPageDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            short_body_chars: 100,
            long_body_chars: 1500,
        }
    }

    pub fn classify(&self, input: DetectorInput<'_>) -> ErrorVerdict {
        let text = input.text.trim();
        let lower = text.to_lowercase();
        let len = text.chars().count();
        let long = len >= self.long_body_chars;

        let mut score = 0.0;
        let mut signals: Vec<String> = Vec::new();
        let mut fire = |name: String, weight: f64, score: &mut f64| {
            *score += weight;
            signals.push(name);
        };

        // Keyword sets; a long body is expected to mention these words in passing.
        let damping = if long { 0.4 } else { 1.0 };
        let mut best_kind: Option<(ErrorKind, usize)> = None;
        let mut total_hits = 0usize;
        for set in PHRASE_SETS {
            let hits = count_distinct_hits(&lower, set.phrases);
            if hits == 0 {
                continue;
            }
            total_hits += hits;
            let weight = if set.kind == ErrorKind::Challenge { 0.45 } else { 0.35 };
            let extra = ((hits - 1) as f64 * 0.1).min(0.2);
            fire(format!("phrase_{}", set.kind.as_str()), (weight + extra) * damping, &mut score);
            if best_kind.map_or(true, |(_, n)| hits > n) {
                best_kind = Some((set.kind, hits));
            }
        }

        if let Some(title) = input.title {
            let title = title.to_lowercase();
            if let Some(hit) = TITLE_INDICATORS.iter().find(|t| title.contains(*t)) {
                fire(format!("title_{}", hit.replace(' ', "_")), 0.5, &mut score);
                if best_kind.is_none() {
                    best_kind = Some((kind_for_title(&title), 1));
                }
            }
        }

        if !long && STATUS_CODE.is_match(&lower) && total_hits > 0 {
            fire("status_code".to_string(), 0.15, &mut score);
        }

        if len < self.short_body_chars {
            fire("short_body".to_string(), 0.2, &mut score);
            if SHORT_BODY_WORDS.iter().any(|w| lower.contains(w)) {
                fire("short_error_body".to_string(), 0.2, &mut score);
                best_kind.get_or_insert((ErrorKind::Generic, 1));
            }
        }

        if len >= 20 {
            let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
            if !letters.is_empty() {
                let caps = letters.iter().filter(|c| c.is_uppercase()).count() as f64 / letters.len() as f64;
                if caps > 0.5 {
                    fire("caps_ratio".to_string(), 0.15, &mut score);
                }
            }
            let symbols = text
                .chars()
                .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
                .count() as f64
                / len as f64;
            if symbols > 0.3 {
                fire("symbol_ratio".to_string(), 0.15, &mut score);
            }
        }

        if input.dom_markers > 0 {
            fire("dom_error_marker".to_string(), 0.3, &mut score);
            best_kind.get_or_insert((ErrorKind::Generic, 1));
        }

        let confidence = (score.min(1.0) * 1000.0).round() / 1000.0;
        let is_error = score >= self.threshold && best_kind.is_some();
        ErrorVerdict {
            is_error,
            confidence,
            kind: if is_error { best_kind.map(|(k, _)| k) } else { None },
            signals,
        }
    }
}

/// Phrases present in `lower`. An occurrence inside a longer matched phrase
/// does not count again, so "page not found" is one hit, not two.
fn count_distinct_hits(lower: &str, phrases: &[&str]) -> usize {
    let mut found: Vec<&str> = phrases.iter().copied().filter(|p| lower.contains(p)).collect();
    found.sort_by_key(|p| Reverse(p.len()));

    let mut claimed: Vec<(usize, usize)> = Vec::new();
    let mut hits = 0;
    for phrase in found {
        let spans: Vec<(usize, usize)> = lower.match_indices(phrase).map(|(i, m)| (i, i + m.len())).collect();
        let uncovered = spans
            .iter()
            .any(|&(start, end)| !claimed.iter().any(|&(s, e)| s <= start && end <= e));
        if uncovered {
            hits += 1;
        }
        claimed.extend(spans);
    }
    hits
}

fn kind_for_title(title: &str) -> ErrorKind {
    if title.contains("404") || title.contains("not found") {
        ErrorKind::NotFound
    } else if title.contains("403") || title.contains("forbidden") || title.contains("denied") {
        ErrorKind::Forbidden
    } else if title.contains("captcha") || title.contains("challenge") || title.contains("just a moment") {
        ErrorKind::Challenge
    } else if title.contains("500") || title.contains("502") || title.contains("503") {
        ErrorKind::ServerError
    } else {
        ErrorKind::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multilingual_not_found_page_is_flagged() {
        let body = "404 Not Found\n404 Seite nicht gefunden\n404 Page introuvable\n\
                    404 Página no encontrada\n404 Pagina non trovata";
        let verdict = ErrorPageDetector::default().classify(DetectorInput::text(body));
        assert!(verdict.is_error);
        assert!(verdict.confidence >= 0.6, "confidence {}", verdict.confidence);
        assert_eq!(verdict.kind, Some(ErrorKind::NotFound));
    }

    #[test]
    fn nested_phrases_count_once() {
        let not_found = PHRASE_SETS[0].phrases;
        assert_eq!(count_distinct_hits("sorry, 404 page not found", not_found), 1);
        assert_eq!(count_distinct_hits("404 not found", not_found), 1);
        assert_eq!(count_distinct_hits("page not found. seite nicht gefunden", not_found), 2);
        assert_eq!(count_distinct_hits("page not found, and the image was not found either", not_found), 2);
    }

    #[test]
    fn cloudflare_challenge_is_flagged() {
        let body = "Checking your browser before accessing example.com. \
                    This process is automatic. DDoS protection by Cloudflare. Ray ID: 7a1b2c3d4e";
        let verdict = ErrorPageDetector::default().classify(DetectorInput::text(body));
        assert!(verdict.is_error);
        assert_eq!(verdict.kind, Some(ErrorKind::Challenge));
    }

    #[test]
    fn long_article_mentioning_errors_is_clean() {
        let paragraph = "Engineers studied how the server error budget was spent during the \
                         migration, and they wrote a long report about retries, caches and queues. ";
        let body = paragraph.repeat(20);
        let verdict = ErrorPageDetector::default().classify(DetectorInput::text(&body));
        assert!(!verdict.is_error, "{verdict:?}");
    }

    #[test]
    fn title_and_dom_markers_count() {
        let input = DetectorInput {
            text: "Please wait while we check a few things before letting you in to the store.",
            title: Some("Just a moment..."),
            dom_markers: 1,
        };
        let verdict = ErrorPageDetector::default().classify(input);
        assert!(verdict.is_error);
        assert_eq!(verdict.kind, Some(ErrorKind::Challenge));
        assert!(verdict.signals.iter().any(|s| s == "dom_error_marker"));
    }

    #[test]
    fn empty_text_alone_is_not_an_error() {
        let verdict = ErrorPageDetector::default().classify(DetectorInput::text(""));
        assert!(!verdict.is_error);
        assert_eq!(verdict.signals, vec!["short_body".to_string()]);
    }
}
