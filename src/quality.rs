//! Content quality scoring.
//!
//! Everything here is a pure function of the input text. Sub-scores are
//! normalised to `[0, 1]`, higher is better for all four, and the aggregate
//! is their weighted mean.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::QualityWeights;

static SENTENCE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+\s+").unwrap());
static PARAGRAPH_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());
static MULTI_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[!?]{2,}|\.{3,}").unwrap());
static HEADING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^#{1,6}\s+\S").unwrap(),
        Regex::new(r"^[A-ZÄÖÜ][^.!?]*$").unwrap(),
        Regex::new(r"^\d+\.?\s+[A-ZÄÖÜ]").unwrap(),
        Regex::new(r"^[IVX]+\.?\s+[A-ZÄÖÜ]").unwrap(),
    ]
});
static ERROR_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|fehler|erreur|404|not found|page not found)\b|[{}\[\]<>]").unwrap()
});

const ERROR_PHRASES: &[&str] = &[
    "404", "not found", "error", "forbidden", "access denied", "server error", "bad request",
    "unauthorized", "timeout", "cloudflare", "ray id", "blocked", "captcha",
];

#[derive(Debug, Clone, PartialEq, Default, Serialize, ToSchema)]
pub struct QualityMetrics {
    pub character_length: usize,
    pub word_count: usize,
    pub sentence_count: usize,
    pub paragraph_count: usize,
    pub readability: f64,
    pub diversity: f64,
    pub structure: f64,
    /// Inverse of the noise/error-indicator level: 1.0 means clean.
    pub cleanliness: f64,
    pub aggregate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    weights: QualityWeights,
}

impl QualityScorer {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, text: &str) -> QualityMetrics {
        let text = text.trim();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return QualityMetrics::default();
        }

        let sentences = split_sentences(text);
        let paragraphs = split_paragraphs(text);

        let readability = readability_score(&words, sentences.len());
        let diversity = diversity_score(&words);
        let structure = structure_score(text, &words, &sentences, paragraphs.len());
        let cleanliness = cleanliness_score(text, &words, &sentences);

        let w = &self.weights;
        let total = w.readability + w.diversity + w.structure + w.cleanliness;
        let aggregate = if total > 0.0 {
            (readability * w.readability
                + diversity * w.diversity
                + structure * w.structure
                + cleanliness * w.cleanliness)
                / total
        } else {
            0.0
        };

        QualityMetrics {
            character_length: text.chars().count(),
            word_count: words.len(),
            sentence_count: sentences.len(),
            paragraph_count: paragraphs.len(),
            readability: round3(readability),
            diversity: round3(diversity),
            structure: round3(structure),
            cleanliness: round3(cleanliness),
            aggregate: round3(clamp01(aggregate)),
        }
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    SENTENCE_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    PARAGRAPH_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn count_syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    let mut count = 0;
    let mut prev_vowel = false;
    for c in lower.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y' | 'ä' | 'ö' | 'ü' | 'é' | 'è' | 'à');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    if lower.ends_with('e') && count > 1 {
        count -= 1;
    }
    count.max(1)
}

/// Flesch reading ease (German variant), mapped onto [0, 1].
fn readability_score(words: &[&str], sentence_count: usize) -> f64 {
    if sentence_count == 0 {
        return 0.0;
    }
    let asl = words.len() as f64 / sentence_count as f64;
    let syllables: usize = words.iter().map(|w| count_syllables(w)).sum();
    let asw = syllables as f64 / words.len() as f64;
    let flesch = 180.0 - asl - 58.5 * asw;
    clamp01(flesch / 100.0)
}

/// Mean of the type-token ratio and normalised Shannon entropy of the vocabulary.
fn diversity_score(words: &[&str]) -> f64 {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for w in words {
        *freq.entry(w.to_lowercase()).or_insert(0) += 1;
    }
    let n = words.len() as f64;
    let ttr = freq.len() as f64 / n;
    let entropy: f64 = freq
        .values()
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum();
    clamp01((ttr + (entropy / 5.0).min(1.0)) / 2.0)
}

fn structure_score(text: &str, words: &[&str], sentences: &[&str], paragraph_count: usize) -> f64 {
    let avg_paragraph = words.len() as f64 / paragraph_count.max(1) as f64;

    let headings = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && l.len() < 120)
        .filter(|l| HEADING_PATTERNS.iter().any(|re| re.is_match(l)))
        .count();
    let heading_ratio = headings as f64 / words.len() as f64;

    let variance = if sentences.len() > 1 {
        let lengths: Vec<f64> = sentences
            .iter()
            .map(|s| s.split_whitespace().count() as f64)
            .collect();
        let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
        lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64
    } else {
        0.0
    };

    let well_formed =
        paragraph_count >= 2 && avg_paragraph > 10.0 && avg_paragraph < 200.0 && variance < 100.0;
    let base = if well_formed { 0.8 } else { 0.3 };
    let bonus = (heading_ratio * 10.0).min(0.2);
    let penalty = (variance / 1000.0).min(0.3);
    clamp01(base + bonus - penalty)
}

/// Mean Jaccard overlap of adjacent sentences, scaled.
fn coherence(sentences: &[&str]) -> f64 {
    if sentences.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for pair in sentences.windows(2) {
        let a: HashSet<String> = pair[0].split_whitespace().map(str::to_lowercase).collect();
        let b: HashSet<String> = pair[1].split_whitespace().map(str::to_lowercase).collect();
        if a.is_empty() || b.is_empty() {
            continue;
        }
        let union = a.union(&b).count() as f64;
        total += a.intersection(&b).count() as f64 / union;
        pairs += 1;
    }
    if pairs == 0 {
        0.0
    } else {
        (total / pairs as f64 * 2.0).min(1.0)
    }
}

/// Noise/error-indicator level in [0, 1], higher meaning more likely an error page.
fn indicator_level(text: &str, sentences: &[&str]) -> f64 {
    let len = text.chars().count();
    let special = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count() as f64
        / len as f64;
    let tokens = ERROR_TOKENS.find_iter(text).count();
    let lower = text.to_lowercase();
    let phrase_hits = ERROR_PHRASES.iter().filter(|p| lower.contains(*p)).count();

    let mut level = 0.0;
    if len < 100 && tokens > 0 {
        level += 0.4;
    }
    if special > 0.3 {
        level += 0.3;
    }
    if MULTI_PUNCT.find_iter(text).count() > 5 {
        level += 0.2;
    }
    if sentences.len() < 2 {
        level += 0.1;
    }
    level += (phrase_hits as f64 * 0.1).min(0.4);
    clamp01(level)
}

fn cleanliness_score(text: &str, words: &[&str], sentences: &[&str]) -> f64 {
    let len = text.chars().count() as f64;
    let letters = text.chars().filter(|c| c.is_alphabetic()).count() as f64;
    let non_space = text.chars().filter(|c| !c.is_whitespace()).count().max(1) as f64;
    let non_letter = (non_space - letters).max(0.0) / non_space;
    let caps = text.chars().filter(|c| c.is_uppercase()).count() as f64 / len.max(1.0);

    let mut freq: HashMap<String, usize> = HashMap::new();
    for w in words {
        *freq.entry(w.to_lowercase()).or_insert(0) += 1;
    }
    let repeated: usize = freq.values().filter(|&&c| c > 1).map(|c| c - 1).sum();
    let repetition = repeated as f64 / words.len() as f64;

    let noise = ((non_letter + caps + repetition) / 3.0).min(1.0);
    let noise_coherence = (coherence(sentences) + (1.0 - noise)) / 2.0;
    // Long texts are expected to reuse words; coherence lifts them back up.
    let base = noise_coherence.max(1.0 - noise).min(1.0);
    clamp01(base * (1.0 - indicator_level(text, sentences)))
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROSE: &str = "The river town grew slowly along the eastern bank. \
        Merchants arrived each spring with cloth, salt and iron tools. \
        Farmers traded grain for these goods at the weekly market.\n\n\
        By the third decade a stone bridge connected both shores. \
        Travellers paid a small toll that funded repairs and lanterns. \
        The council kept careful records of every coin collected.\n\n\
        Schools opened once the population passed two thousand people. \
        Children learned reading, arithmetic and the history of the valley.";

    #[test]
    fn empty_text_scores_zero() {
        let scorer = QualityScorer::default();
        assert_eq!(scorer.score(""), QualityMetrics::default());
        assert_eq!(scorer.score("   \n\t ").aggregate, 0.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let scorer = QualityScorer::default();
        assert_eq!(scorer.score(PROSE), scorer.score(PROSE));
    }

    #[test]
    fn scores_stay_in_unit_range() {
        let scorer = QualityScorer::default();
        for text in [PROSE, "!!!???...", "404", "a a a a a a a a", "{}[]<><><>"] {
            let m = scorer.score(text);
            for v in [m.readability, m.diversity, m.structure, m.cleanliness, m.aggregate] {
                assert!((0.0..=1.0).contains(&v), "{v} out of range for {text:?}");
            }
        }
    }

    #[test]
    fn prose_beats_error_page() {
        let scorer = QualityScorer::default();
        let prose = scorer.score(PROSE);
        let error = scorer.score("ERROR 404!!! Page not found {{}}");
        assert!(prose.aggregate > error.aggregate);
        assert!(prose.cleanliness > error.cleanliness);
        assert_eq!(prose.paragraph_count, 3);
    }

    #[test]
    fn syllables_never_zero() {
        assert_eq!(count_syllables("rhythm"), 1);
        assert_eq!(count_syllables("table"), 1);
        assert_eq!(count_syllables("extraction"), 3);
    }

    #[test]
    fn indicator_level_rises_for_challenge_text() {
        let text = "Checking your browser. Cloudflare Ray ID: 1234";
        assert!(indicator_level(text, &split_sentences(text)) >= 0.2);
    }
}
