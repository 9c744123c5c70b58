//! Turns one `ExtractionRequest` into exactly one `ExtractionOutcome`.
//!
//! `auto` starts on the static path and escalates to the browser only when the
//! static result is missing, empty, looks like an error page, or (under a
//! recall/precision bias) scores below the quality threshold. The two paths
//! never run concurrently. No error crosses this boundary; every failure
//! becomes an outcome with a status of 400 or more.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::browser::{BrowserBackend, BrowserPage, DynamicFetcher};
use crate::config::ExtractorConfig;
use crate::convert::FileConverter;
use crate::detector::{DetectorInput, ErrorPageDetector};
use crate::error::FetchError;
use crate::links::LinkExtractor;
use crate::model::{
    ContentCandidate, ExtractionBias, ExtractionMode, ExtractionOutcome, ExtractionRequest, FetchAttempt, FetchPath,
    Origin,
};
use crate::proxy::ProxyPool;
use crate::quality::QualityScorer;
use crate::retry::RetryController;
use crate::static_fetch::{HttpTransport, StaticFetcher, StaticPage};

const SUCCESS_REASON: &str = "Text extracted successfully";

pub struct Orchestrator {
    config: ExtractorConfig,
    pool: Arc<ProxyPool>,
    retry: RetryController,
    static_fetcher: StaticFetcher,
    dynamic: Option<DynamicFetcher>,
    detector: ErrorPageDetector,
    scorer: QualityScorer,
    links: Arc<dyn LinkExtractor>,
}

/// Everything gathered while the fetch paths ran.
#[derive(Default)]
struct Collected {
    attempts: Vec<FetchAttempt>,
    candidates: Vec<ContentCandidate>,
    last_error: Option<(FetchPath, FetchError)>,
    escalated: bool,
}

impl Orchestrator {
    pub fn new(
        config: ExtractorConfig,
        pool: Arc<ProxyPool>,
        transport: Arc<dyn HttpTransport>,
        browser: Option<Arc<dyn BrowserBackend>>,
        converter: Arc<dyn FileConverter>,
        links: Arc<dyn LinkExtractor>,
    ) -> Self {
        let detector = ErrorPageDetector::new(config.error_verdict_threshold);
        let dynamic = browser.map(|backend| {
            DynamicFetcher::new(
                backend,
                config.browser.clone(),
                detector.clone(),
                config.min_substantial_chars,
                config.teardown_grace,
            )
        });
        Self {
            retry: RetryController::new(&config.retry),
            static_fetcher: StaticFetcher::new(transport, converter, config.min_static_chars, config.near_empty_chars),
            scorer: QualityScorer::new(config.weights.clone()),
            dynamic,
            detector,
            links,
            pool,
            config,
        }
    }

    /// The operator-seeded pool; caller-supplied proxies never enter it.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn browser_available(&self) -> bool {
        self.dynamic.as_ref().is_some_and(DynamicFetcher::is_available)
    }

    pub async fn extract(&self, request: ExtractionRequest) -> ExtractionOutcome {
        let request_id = Uuid::new_v4();
        let span = info_span!("extract", %request_id, url = %request.url);
        self.run(&request).instrument(span).await
    }

    async fn run(&self, request: &ExtractionRequest) -> ExtractionOutcome {
        let started = Instant::now();
        let url = match parse_target(&request.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "rejecting request");
                return self.failure(request, request.mode, &e, &Collected::default());
            }
        };

        // Inner stages stop at the deadline; this only catches a stage that ignores it.
        let attempts_started = AtomicUsize::new(0);
        let hard_stop = started + request.timeout + self.config.teardown_grace;
        let outcome = match timeout_at(hard_stop, self.orchestrate(request, &url, started, &attempts_started)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout_s = request.timeout.as_secs(), "request overran its budget");
                let e = FetchError::timeout_after(request.timeout);
                let mut outcome = self.failure(request, request.mode, &e, &Collected::default());
                outcome.attempts = attempts_started.load(Ordering::Relaxed);
                outcome
            }
        };

        info!(
            status = outcome.status,
            success = outcome.is_success(),
            origin = ?outcome.extraction_origin,
            mode = ?outcome.mode,
            method = outcome.method.map(|m| m.as_str()),
            attempts = outcome.attempts,
            chars = outcome.text.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction finished"
        );
        outcome
    }

    async fn orchestrate(
        &self,
        request: &ExtractionRequest,
        url: &Url,
        started: Instant,
        attempts_started: &AtomicUsize,
    ) -> ExtractionOutcome {
        let deadline = started + request.timeout;
        let mut collected = Collected::default();

        // Caller proxies live only as long as this request.
        let request_pool;
        let pool: &ProxyPool = if request.proxies.is_empty() {
            &self.pool
        } else {
            request_pool = ProxyPool::with_addresses(&request.proxies, &self.config.proxy);
            &request_pool
        };

        if request.mode != ExtractionMode::Browser {
            let static_deadline = if request.mode == ExtractionMode::Auto && self.dynamic.is_some() {
                started + request.timeout.mul_f64(self.config.static_budget_share.clamp(0.1, 1.0))
            } else {
                deadline
            };
            // A hung proxy must leave room for the remaining attempts and the direct fallback.
            let per_attempt = (static_deadline - started) / self.config.retry.max_attempts.max(1);
            let fetcher = &self.static_fetcher;
            let report = self
                .retry
                .run(FetchPath::Static, pool, static_deadline, move |proxy, remaining| {
                    attempts_started.fetch_add(1, Ordering::Relaxed);
                    async move { fetcher.fetch(request, url, proxy.as_deref(), remaining.min(per_attempt)).await }
                })
                .await;
            collected.attempts.extend(report.attempts);
            match report.result {
                Ok(page) => collected.candidates.push(self.static_candidate(page, report.proxy)),
                Err(e) => collected.last_error = Some((FetchPath::Static, e)),
            }
        }

        let run_browser = match request.mode {
            ExtractionMode::Simple => false,
            ExtractionMode::Browser => true,
            ExtractionMode::Auto => match collected.candidates.first() {
                // A browser cannot render a document the converter rejected.
                None => !matches!(collected.last_error, Some((_, FetchError::Conversion { .. }))),
                Some(candidate) => self.should_escalate(candidate, request.bias),
            },
        };

        if run_browser {
            collected.escalated = request.mode == ExtractionMode::Auto;
            match &self.dynamic {
                Some(dynamic) => {
                    let report = self
                        .retry
                        .run(FetchPath::Browser, pool, deadline, move |proxy, remaining| {
                            attempts_started.fetch_add(1, Ordering::Relaxed);
                            async move { dynamic.fetch(url, request.output, proxy.as_deref(), remaining).await }
                        })
                        .await;
                    collected.attempts.extend(report.attempts);
                    match report.result {
                        Ok(page) => collected.candidates.push(self.browser_candidate(page, report.proxy)),
                        Err(e) => collected.last_error = Some((FetchPath::Browser, e)),
                    }
                }
                None => {
                    warn!("browser path requested but no browser backend is configured");
                    collected.last_error = Some((
                        FetchPath::Browser,
                        FetchError::Launch("no browser backend configured".to_string()),
                    ));
                }
            }
        }

        self.finish(request, collected)
    }

    fn should_escalate(&self, candidate: &ContentCandidate, bias: ExtractionBias) -> bool {
        let chars = candidate.plain.chars().count();
        if chars < self.config.near_empty_chars {
            info!(chars, "no text content could be extracted statically, escalating");
            return true;
        }
        if candidate.verdict.is_error {
            info!(confidence = candidate.verdict.confidence, kind = ?candidate.verdict.kind, "static result looks like an error page, escalating");
            return true;
        }
        if bias != ExtractionBias::None && candidate.aggregate() < self.config.quality_threshold {
            info!(
                aggregate = candidate.aggregate(),
                threshold = self.config.quality_threshold,
                ?bias,
                "static quality below threshold, escalating"
            );
            return true;
        }
        false
    }

    fn static_candidate(&self, page: StaticPage, proxy: Option<String>) -> ContentCandidate {
        let verdict = self.detector.classify(DetectorInput::text(&page.plain));
        let quality = self.scorer.score(&page.plain);
        ContentCandidate {
            text: page.text,
            plain: page.plain,
            method: page.method,
            origin: FetchPath::Static,
            status: page.status,
            final_url: page.final_url,
            proxy,
            html: page.html,
            conversion: page.conversion,
            degraded: false,
            strategies: Vec::new(),
            verdict,
            quality,
        }
    }

    fn browser_candidate(&self, page: BrowserPage, proxy: Option<String>) -> ContentCandidate {
        let quality = self.scorer.score(&page.plain);
        ContentCandidate {
            text: page.text,
            plain: page.plain,
            method: page.method,
            origin: FetchPath::Browser,
            status: page.status,
            final_url: page.final_url,
            proxy,
            html: Some(page.html),
            conversion: None,
            degraded: page.degraded,
            strategies: page.strategies_tried,
            verdict: page.verdict,
            quality,
        }
    }

    fn finish(&self, request: &ExtractionRequest, collected: Collected) -> ExtractionOutcome {
        let Some(winner) = select_winner(&collected.candidates) else {
            return match &collected.last_error {
                Some((path, e)) => self.failure(request, path.mode(), e, &collected),
                None => self.empty_content(request, &collected),
            };
        };

        let (status, reason, error_kind) = if winner.verdict.is_error {
            let kind = winner.verdict.kind;
            (
                kind.map_or(422, |k| k.status()),
                format!(
                    "Content looks like a {} page (confidence {:.2})",
                    kind.map_or("error", |k| k.as_str()),
                    winner.verdict.confidence
                ),
                Some(kind.map_or("error_page", |k| k.as_str()).to_string()),
            )
        } else if winner.degraded {
            (
                winner.status,
                format!("{SUCCESS_REASON}; content is shorter than expected and may be incomplete"),
                None,
            )
        } else {
            (winner.status, SUCCESS_REASON.to_string(), None)
        };

        let origin = if status >= 400 {
            Origin::LiveError
        } else if collected.escalated && winner.origin == FetchPath::Browser {
            Origin::LiveFallback
        } else {
            Origin::Live
        };

        let links = request.include_links.then(|| match &winner.html {
            Some(document) => self.links.extract(document, &winner.final_url),
            None => Vec::new(),
        });

        ExtractionOutcome {
            text: winner.text.clone(),
            status,
            reason,
            error_kind,
            final_url: winner.final_url.clone(),
            mode: winner.origin.mode(),
            method: Some(winner.method),
            proxy_used: winner.proxy.clone(),
            quality_metrics: request.calculate_quality.then(|| winner.quality.clone()),
            lang: language(request, &winner.plain),
            converted: winner.conversion.is_some(),
            original_format: winner.conversion.as_ref().map(|c| c.original_format.clone()),
            file_size_mb: winner.conversion.as_ref().map(|c| c.file_size_mb),
            links,
            attempts: collected.attempts.len(),
            candidates_tried: collected.candidates.iter().map(ContentCandidate::summary).collect(),
            extraction_timestamp: Utc::now(),
            extraction_origin: origin,
        }
    }

    fn failure(
        &self,
        request: &ExtractionRequest,
        mode: ExtractionMode,
        error: &FetchError,
        collected: &Collected,
    ) -> ExtractionOutcome {
        let status = error.status().max(400);
        self.failed_outcome(
            request,
            mode,
            status,
            format!("Extraction failed: {error}"),
            error.kind(),
            collected,
        )
    }

    fn empty_content(&self, request: &ExtractionRequest, collected: &Collected) -> ExtractionOutcome {
        let mode = collected
            .candidates
            .last()
            .map_or(request.mode, |c| c.origin.mode());
        self.failed_outcome(
            request,
            mode,
            422,
            "No text content could be extracted".to_string(),
            "empty_content",
            collected,
        )
    }

    fn failed_outcome(
        &self,
        request: &ExtractionRequest,
        mode: ExtractionMode,
        status: u16,
        reason: String,
        error_kind: &str,
        collected: &Collected,
    ) -> ExtractionOutcome {
        ExtractionOutcome {
            text: String::new(),
            status,
            reason,
            error_kind: Some(error_kind.to_string()),
            final_url: request.url.clone(),
            mode,
            method: None,
            proxy_used: None,
            quality_metrics: request.calculate_quality.then(Default::default),
            lang: None,
            converted: false,
            original_format: None,
            file_size_mb: None,
            links: request.include_links.then(Vec::new),
            attempts: collected.attempts.len(),
            candidates_tried: collected.candidates.iter().map(ContentCandidate::summary).collect(),
            extraction_timestamp: Utc::now(),
            extraction_origin: Origin::LiveError,
        }
    }
}

/// Higher aggregate wins; a tie goes to the browser candidate. Empty text never wins.
fn select_winner(candidates: &[ContentCandidate]) -> Option<&ContentCandidate> {
    candidates
        .iter()
        .filter(|c| !c.plain.trim().is_empty())
        .reduce(|best, c| {
            let better = c.aggregate() > best.aggregate()
                || (c.aggregate() == best.aggregate() && c.origin == FetchPath::Browser);
            if better {
                c
            } else {
                best
            }
        })
}

fn parse_target(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidUrl(format!("unsupported scheme `{other}`"))),
    }
}

fn language(request: &ExtractionRequest, text: &str) -> Option<String> {
    match request.target_language.as_deref() {
        Some(lang) if !lang.eq_ignore_ascii_case("auto") => Some(lang.to_string()),
        _ => whatlang::detect(text).map(|info| info.lang().code().to_string()),
    }
}
