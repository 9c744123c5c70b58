//! Document-to-text conversion collaborator.
//!
//! The engine only decides *when* to convert; the conversion itself is
//! delegated to a [`FileConverter`]. The default implementation shells out to
//! `markitdown`, with `pdftotext` as a PDF-only fallback.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::error::ConversionError;

const MIME_FORMATS: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    ("application/vnd.openxmlformats-officedocument.wordprocessingml.document", "docx"),
    ("application/msword", "doc"),
    ("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet", "xlsx"),
    ("application/vnd.ms-excel", "xls"),
    ("application/vnd.openxmlformats-officedocument.presentationml.presentation", "pptx"),
    ("application/vnd.ms-powerpoint", "ppt"),
    ("application/vnd.oasis.opendocument.text", "odt"),
    ("application/vnd.oasis.opendocument.presentation", "odp"),
    ("application/vnd.oasis.opendocument.spreadsheet", "ods"),
    ("application/rtf", "rtf"),
    ("text/rtf", "rtf"),
];

const EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "xlsx", "xls", "pptx", "ppt", "odt", "odp", "ods", "rtf"];

/// Detects a convertible document format from the response content type,
/// falling back to the URL path extension.
pub fn detect_format(content_type: Option<&str>, url: &str) -> Option<&'static str> {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if let Some((_, format)) = MIME_FORMATS.iter().find(|(mime, _)| ct.contains(mime)) {
            return Some(*format);
        }
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            return None;
        }
    }

    let path = url::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());
    let ext = path.rsplit('.').next()?;
    EXTENSIONS.iter().find(|e| **e == ext).copied()
}

/// Limits the caller set for one conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionLimits {
    pub max_file_size_mb: u64,
    pub timeout: Duration,
}

/// Metadata attached to the outcome when a document was converted.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ConversionInfo {
    pub original_format: String,
    pub file_size_mb: f64,
}

#[async_trait]
pub trait FileConverter: Send + Sync {
    async fn convert(&self, bytes: &[u8], format: &str, limits: ConversionLimits) -> Result<String, ConversionError>;
}

pub fn size_mb(bytes: &[u8]) -> f64 {
    bytes.len() as f64 / (1024.0 * 1024.0)
}

/// Enforces the size limit before any conversion work starts.
pub fn check_size(bytes: &[u8], limits: ConversionLimits) -> Result<(), ConversionError> {
    let actual_mb = size_mb(bytes);
    if actual_mb > limits.max_file_size_mb as f64 {
        return Err(ConversionError::SizeExceeded {
            actual_mb,
            limit_mb: limits.max_file_size_mb,
        });
    }
    Ok(())
}

/// Converts with external command-line tools.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    markitdown: String,
    pdftotext: String,
}

impl Default for CommandConverter {
    fn default() -> Self {
        Self {
            markitdown: "markitdown".to_string(),
            pdftotext: "pdftotext".to_string(),
        }
    }
}

impl CommandConverter {
    pub fn new(markitdown: impl Into<String>, pdftotext: impl Into<String>) -> Self {
        Self {
            markitdown: markitdown.into(),
            pdftotext: pdftotext.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<String, ConversionError> {
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ConversionError::Failed(format!("{program}: {e}"))),
            Err(_) => return Err(ConversionError::Timeout(timeout)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConversionError::Failed(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl FileConverter for CommandConverter {
    async fn convert(&self, bytes: &[u8], format: &str, limits: ConversionLimits) -> Result<String, ConversionError> {
        if !EXTENSIONS.iter().any(|e| *e == format) {
            return Err(ConversionError::UnsupportedFormat(format.to_string()));
        }
        check_size(bytes, limits)?;

        let mut file = tempfile::Builder::new()
            .prefix("extract-")
            .suffix(&format!(".{format}"))
            .tempfile()
            .map_err(|e| ConversionError::Failed(e.to_string()))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| ConversionError::Failed(e.to_string()))?;
        let path = file.path().to_string_lossy().to_string();

        info!(format, size_mb = size_mb(bytes), "converting document");
        match self.run(&self.markitdown, &[&path], limits.timeout).await {
            Ok(text) if !text.is_empty() => return Ok(text),
            Ok(_) => debug!(format, "markitdown produced no text"),
            Err(ConversionError::Timeout(t)) => return Err(ConversionError::Timeout(t)),
            Err(e) => warn!(format, error = %e, "markitdown conversion failed"),
        }

        if format == "pdf" {
            let text = self.run(&self.pdftotext, &[&path, "-"], limits.timeout).await?;
            if !text.is_empty() {
                return Ok(text);
            }
        }
        Err(ConversionError::Failed(format!("no text could be extracted from {format}")))
    }
}
