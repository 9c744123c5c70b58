use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use utoipa::ToSchema;

use crate::convert::ConversionInfo;
use crate::detector::ErrorVerdict;
use crate::links::LinkInfo;
use crate::quality::QualityMetrics;

// ============================================================================
// Request side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    Simple,
    Browser,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputShape {
    Text,
    #[default]
    Markdown,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionBias {
    #[default]
    None,
    Recall,
    Precision,
}

/// One extraction job. Built once and never changed after it reaches the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub url: String,
    pub mode: ExtractionMode,
    pub output: OutputShape,
    pub bias: ExtractionBias,
    /// `host:port` proxies for this request; empty means "any pooled proxy".
    pub proxies: Vec<String>,
    pub timeout: Duration,
    pub include_links: bool,
    pub calculate_quality: bool,
    pub convert_files: bool,
    pub max_file_size_mb: u64,
    pub conversion_timeout: Duration,
    /// Language reported on the outcome; `None` means detect it.
    pub target_language: Option<String>,
}

impl ExtractionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: ExtractionMode::Auto,
            output: OutputShape::Markdown,
            bias: ExtractionBias::None,
            proxies: Vec::new(),
            timeout: Duration::from_secs(30),
            include_links: false,
            calculate_quality: false,
            convert_files: false,
            max_file_size_mb: 50,
            conversion_timeout: Duration::from_secs(60),
            target_language: None,
        }
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_output(mut self, output: OutputShape) -> Self {
        self.output = output;
        self
    }

    pub fn with_bias(mut self, bias: ExtractionBias) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_links(mut self, include: bool) -> Self {
        self.include_links = include;
        self
    }

    pub fn with_quality(mut self, calculate: bool) -> Self {
        self.calculate_quality = calculate;
        self
    }

    pub fn with_conversion(mut self, enabled: bool) -> Self {
        self.convert_files = enabled;
        self
    }
}

// ============================================================================
// Attempts and candidates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FetchPath {
    Static,
    Browser,
}

impl FetchPath {
    pub fn mode(self) -> ExtractionMode {
        match self {
            FetchPath::Static => ExtractionMode::Simple,
            FetchPath::Browser => ExtractionMode::Browser,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    Failed {
        kind: &'static str,
        message: String,
        transient: bool,
    },
}

/// One row of the per-request attempt log kept by the retry controller.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAttempt {
    pub proxy: Option<String>,
    pub path: FetchPath,
    pub delay_before: Duration,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

/// Which extraction routine produced a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    Structured,
    HtmlToText,
    RegexStrip,
    Converted,
    MainSelectors,
    ReadableFiltered,
    DomFallback,
    EmbeddedData,
    StateGlobals,
    ShadowDom,
    Frames,
    TextMining,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::Structured => "structured",
            ExtractionMethod::HtmlToText => "html-to-text",
            ExtractionMethod::RegexStrip => "regex-strip",
            ExtractionMethod::Converted => "converted",
            ExtractionMethod::MainSelectors => "main-selectors",
            ExtractionMethod::ReadableFiltered => "readable-filtered",
            ExtractionMethod::DomFallback => "dom-fallback",
            ExtractionMethod::EmbeddedData => "embedded-data",
            ExtractionMethod::StateGlobals => "state-globals",
            ExtractionMethod::ShadowDom => "shadow-dom",
            ExtractionMethod::Frames => "frames",
            ExtractionMethod::TextMining => "text-mining",
        }
    }
}

/// Text produced by one fetch path, scored and classified.
#[derive(Debug, Clone)]
pub struct ContentCandidate {
    /// Text in the caller's requested shape.
    pub text: String,
    /// Plain text used for detection and scoring.
    pub plain: String,
    pub method: ExtractionMethod,
    pub origin: FetchPath,
    pub status: u16,
    pub final_url: String,
    pub proxy: Option<String>,
    pub html: Option<String>,
    pub conversion: Option<ConversionInfo>,
    /// Set when the browser path fell back to below-threshold content.
    pub degraded: bool,
    /// Browser strategies run, in order; empty on the static path.
    pub strategies: Vec<ExtractionMethod>,
    pub verdict: ErrorVerdict,
    pub quality: QualityMetrics,
}

impl ContentCandidate {
    pub fn aggregate(&self) -> f64 {
        self.quality.aggregate
    }

    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary {
            method: self.method,
            origin: self.origin,
            aggregate: self.quality.aggregate,
            chars: self.plain.chars().count(),
            error_page: self.verdict.is_error,
            strategies: self.strategies.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CandidateSummary {
    pub method: ExtractionMethod,
    pub origin: FetchPath,
    pub aggregate: f64,
    pub chars: usize,
    pub error_page: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<ExtractionMethod>,
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Live,
    LiveFallback,
    LiveError,
}

/// The single result returned for every request, successful or not.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExtractionOutcome {
    pub text: String,
    pub status: u16,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub final_url: String,
    pub mode: ExtractionMode,
    pub method: Option<ExtractionMethod>,
    pub proxy_used: Option<String>,
    pub quality_metrics: Option<QualityMetrics>,
    pub lang: Option<String>,
    pub converted: bool,
    pub original_format: Option<String>,
    pub file_size_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<LinkInfo>>,
    pub attempts: usize,
    pub candidates_tried: Vec<CandidateSummary>,
    #[serde(serialize_with = "serialize_micros")]
    #[schema(value_type = String, format = DateTime)]
    pub extraction_timestamp: DateTime<Utc>,
    pub extraction_origin: Origin,
}

impl ExtractionOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// ISO 8601, UTC, exactly six fractional digits.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn serialize_micros<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(ts))
}
