use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::model::{ExtractionBias, ExtractionMode, ExtractionOutcome, ExtractionRequest, OutputShape};
use crate::orchestrator::Orchestrator;
use crate::proxy::ProxyStats;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtractBody {
    pub url: String,
    #[serde(default)]
    pub mode: ExtractionMode,
    #[serde(default)]
    pub output_format: OutputShape,
    #[serde(default)]
    pub preference: ExtractionBias,
    /// `host:port` proxies to use for this request.
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Seconds, 5 to 120.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub include_links: bool,
    #[serde(default)]
    pub calculate_quality: bool,
    #[serde(default)]
    pub convert_files: bool,
    /// MB, 1 to 100.
    pub max_file_size_mb: Option<u64>,
    /// Seconds, 10 to 300.
    pub conversion_timeout: Option<u64>,
    /// ISO language code reported on the outcome, or `auto` to detect it.
    pub target_language: Option<String>,
}

impl ExtractBody {
    /// Builds the engine request, clamping numeric fields to their accepted ranges.
    pub fn into_request(self) -> ExtractionRequest {
        let mut request = ExtractionRequest::new(self.url)
            .with_mode(self.mode)
            .with_output(self.output_format)
            .with_bias(self.preference)
            .with_proxies(self.proxies)
            .with_links(self.include_links)
            .with_quality(self.calculate_quality)
            .with_conversion(self.convert_files);
        if let Some(secs) = self.timeout {
            request.timeout = Duration::from_secs(secs.clamp(5, 120));
        }
        if let Some(mb) = self.max_file_size_mb {
            request.max_file_size_mb = mb.clamp(1, 100);
        }
        if let Some(secs) = self.conversion_timeout {
            request.conversion_timeout = Duration::from_secs(secs.clamp(10, 300));
        }
        request.target_language = self.target_language.filter(|l| !l.trim().is_empty());
        request
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub browser_available: bool,
}

#[utoipa::path(
    post,
    path = "/extract",
    request_body = ExtractBody,
    responses(
        (status = 200, description = "Extraction outcome; check `status` for the result", body = ExtractionOutcome)
    ),
    tag = "extractor"
)]
pub async fn extract(State(state): State<Arc<AppState>>, Json(body): Json<ExtractBody>) -> Json<ExtractionOutcome> {
    let outcome = state.orchestrator.extract(body.into_request()).await;
    Json(outcome)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "extractor"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        browser_available: state.orchestrator.browser_available(),
    })
}

#[utoipa::path(
    get,
    path = "/proxies",
    responses((status = 200, description = "Proxy pool snapshot", body = ProxyStats)),
    tag = "proxy"
)]
pub async fn list_proxies(State(state): State<Arc<AppState>>) -> Json<ProxyStats> {
    Json(state.orchestrator.pool().stats())
}
