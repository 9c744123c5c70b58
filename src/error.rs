use std::time::Duration;
use thiserror::Error;

/// Failure of a single fetch attempt, on either path.
///
/// Everything below the orchestrator reports through this type; the
/// orchestrator is the only place that turns it into an outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {0}")]
    Http4xx(u16),

    #[error("HTTP {0}")]
    Http5xx(u16),

    #[error("could not decode body: {0}")]
    Decode(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    /// A document could not be converted; `kind` is the [`ConversionError::kind`] tag.
    #[error("document conversion failed: {message}")]
    Conversion { kind: &'static str, message: String },
}

impl FetchError {
    pub fn timeout_after(budget: Duration) -> Self {
        FetchError::Timeout(format!("no response within {}ms", budget.as_millis()))
    }

    /// Stable tag used in attempt logs and outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Connection(_) => "connection",
            FetchError::Http4xx(_) => "http_4xx",
            FetchError::Http5xx(_) => "http_5xx",
            FetchError::Decode(_) => "decode_error",
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::Navigation(_) => "navigation",
            FetchError::Launch(_) => "launch",
            FetchError::Conversion { kind, .. } => kind,
        }
    }

    /// Timeouts, resets, 5xx, 408/429 and browser navigation failures are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) | FetchError::Navigation(_) => true,
            FetchError::Http5xx(_) => true,
            FetchError::Http4xx(status) => matches!(status, 408 | 429),
            FetchError::Decode(_)
            | FetchError::InvalidUrl(_)
            | FetchError::Launch(_)
            | FetchError::Conversion { .. } => false,
        }
    }

    /// HTTP-equivalent status reported when this error ends a request.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::Timeout(_) => 504,
            FetchError::Connection(_) | FetchError::Navigation(_) => 502,
            FetchError::Http4xx(status) | FetchError::Http5xx(status) => *status,
            FetchError::Decode(_) => 500,
            FetchError::InvalidUrl(_) => 400,
            FetchError::Launch(_) => 503,
            FetchError::Conversion { kind, .. } => match *kind {
                "size_exceeded" => 413,
                "unsupported_format" => 415,
                "timeout" => 504,
                _ => 422,
            },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else if err.is_decode() || err.is_body() {
            FetchError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                FetchError::Http5xx(status.as_u16())
            } else {
                FetchError::Http4xx(status.as_u16())
            }
        } else {
            FetchError::Connection(err.to_string())
        }
    }
}

impl From<ConversionError> for FetchError {
    fn from(err: ConversionError) -> Self {
        FetchError::Conversion {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidUrl(err.to_string())
    }
}

/// Failure reported by the file conversion collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("file is {actual_mb:.2}MB, limit is {limit_mb}MB")]
    SizeExceeded { actual_mb: f64, limit_mb: u64 },

    #[error("conversion did not finish within {0:?}")]
    Timeout(Duration),

    #[error("conversion failed: {0}")]
    Failed(String),
}

impl ConversionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::UnsupportedFormat(_) => "unsupported_format",
            ConversionError::SizeExceeded { .. } => "size_exceeded",
            ConversionError::Timeout(_) => "timeout",
            ConversionError::Failed(_) => "conversion_failed",
        }
    }
}

/// Cleanup failure of a browsing context or browser process. Logged, never surfaced.
#[derive(Debug, Error)]
#[error("teardown of {resource} failed: {message}")]
pub struct TeardownError {
    pub resource: &'static str,
    pub message: String,
}
