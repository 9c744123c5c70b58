//! Browser fetch path.
//!
//! One request walks `launch -> navigate -> detect_spa -> wait_stable ->
//! extract -> (success | degrade) -> teardown`. The session is closed on every
//! exit from the later stages; teardown failures are logged and never change
//! the result.

pub mod chrome;
pub mod stability;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BrowserSettings;
use crate::detector::{DetectorInput, ErrorPageDetector, ErrorVerdict};
use crate::error::{FetchError, TeardownError};
use crate::html;
use crate::model::{ExtractionMethod, OutputShape};
use crate::spa::{SpaAssessment, SpaSignals, SPA_SIGNALS_SCRIPT};

use self::stability::{SettleOutcome, SettlePolicy};
use self::strategies::{run_strategies, LiveExtras, Snapshot, LIVE_EXTRAS_SCRIPT};

/// Launches browsing sessions, one isolated context per request.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn open_session(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, FetchError>;

    /// Whether a browser can be launched at all on this host.
    fn is_available(&self) -> bool {
        true
    }
}

/// A live, isolated browsing context.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &Url, timeout: Duration) -> Result<(), FetchError>;

    /// Evaluates an expression in the page and returns its JSON value.
    async fn evaluate(&self, script: &str) -> Result<Value, FetchError>;

    async fn content(&self) -> Result<String, FetchError>;

    async fn current_url(&self) -> Result<String, FetchError>;

    async fn close(self: Box<Self>) -> Result<(), TeardownError>;
}

/// What a browser attempt produced.
#[derive(Debug, Clone)]
pub struct BrowserPage {
    pub status: u16,
    pub final_url: String,
    pub text: String,
    pub plain: String,
    pub method: ExtractionMethod,
    pub html: String,
    pub title: Option<String>,
    /// Best available text fell short of the substantial length, or the page reads as an error.
    pub degraded: bool,
    pub verdict: ErrorVerdict,
    pub spa: SpaAssessment,
    pub settle: SettleOutcome,
    pub strategies_tried: Vec<ExtractionMethod>,
}

pub struct DynamicFetcher {
    backend: Arc<dyn BrowserBackend>,
    settings: BrowserSettings,
    detector: ErrorPageDetector,
    min_chars: usize,
    teardown_grace: Duration,
}

impl DynamicFetcher {
    pub fn new(
        backend: Arc<dyn BrowserBackend>,
        settings: BrowserSettings,
        detector: ErrorPageDetector,
        min_chars: usize,
        teardown_grace: Duration,
    ) -> Self {
        Self {
            backend,
            settings,
            detector,
            min_chars,
            teardown_grace,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// One attempt within `budget`. Launch and navigation failures are
    /// errors; everything after navigation degrades instead of failing.
    pub async fn fetch(
        &self,
        url: &Url,
        shape: OutputShape,
        proxy: Option<&str>,
        budget: Duration,
    ) -> Result<BrowserPage, FetchError> {
        let deadline = Instant::now() + budget;

        let session = match timeout_at(deadline, self.backend.open_session(proxy)).await {
            Ok(opened) => opened?,
            Err(_) => return Err(FetchError::Timeout("browser launch exceeded budget".to_string())),
        };

        let result = match timeout_at(deadline, self.drive(session.as_ref(), url, shape, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::timeout_after(budget)),
        };

        match timeout(self.teardown_grace, session.close()).await {
            Ok(Ok(())) => debug!(url = %url, "browser context closed"),
            Ok(Err(e)) => warn!(url = %url, error = %e, "browser teardown failed"),
            Err(_) => warn!(url = %url, "browser teardown timed out"),
        }
        result
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        url: &Url,
        shape: OutputShape,
        deadline: Instant,
    ) -> Result<BrowserPage, FetchError> {
        let nav_timeout = self
            .settings
            .navigation_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        session.navigate(url, nav_timeout).await?;
        let initial = session.content().await.unwrap_or_default();

        let (spa, live_title) = self.detect_spa(session, url, &initial).await;
        let mut ceiling = self.settings.settle_ceiling;
        if spa.ultra_complex || html::looks_like_placeholder(&initial) {
            ceiling = ceiling.mul_f64(1.5);
            debug!(url = %url, ceiling_ms = ceiling.as_millis() as u64, "placeholder page, extending settle ceiling");
        }

        let settle = if spa.is_spa || spa.ultra_complex {
            let policy = SettlePolicy {
                quiet_period: self.settings.quiet_period,
                quiet_windows: self.settings.quiet_windows,
                tolerance: self.settings.mutation_tolerance,
                ceiling,
            };
            stability::wait_for_stability(session, policy, deadline).await
        } else {
            stability::idle_wait(self.settings.idle_wait, deadline).await
        };
        debug!(url = %url, spa = spa.is_spa, settle = ?settle, "page settled");

        let document = match session.content().await {
            Ok(doc) => doc,
            Err(e) if !initial.is_empty() => {
                warn!(url = %url, error = %e, "snapshot failed, using first content");
                initial
            }
            Err(e) => return Err(e),
        };
        let final_url = session.current_url().await.unwrap_or_else(|_| url.to_string());
        let base = Url::parse(&final_url).unwrap_or_else(|_| url.clone());

        let extras = if spa.ultra_complex {
            debug!(url = %url, ultra_score = spa.ultra_score, "ultra-complex page, collecting live extras");
            Some(live_extras(session).await)
        } else {
            None
        };
        let run = run_strategies(
            &Snapshot {
                html: &document,
                url: &base,
                shape,
                extras: extras.as_ref(),
            },
            self.min_chars,
        );
        let (method, found) = run.best.unwrap_or((
            ExtractionMethod::DomFallback,
            strategies::StrategyText {
                text: String::new(),
                plain: String::new(),
            },
        ));

        let title = live_title.or_else(|| html::page_title(&document));
        let verdict = self.detector.classify(DetectorInput {
            text: &found.plain,
            title: title.as_deref(),
            dom_markers: html::error_marker_count(&document),
        });
        let degraded = !run.satisfied || verdict.is_error;
        if degraded {
            warn!(
                url = %final_url,
                method = method.as_str(),
                chars = found.plain.chars().count(),
                error_page = verdict.is_error,
                "returning degraded browser content"
            );
        } else {
            info!(url = %final_url, method = method.as_str(), chars = found.plain.chars().count(), "browser extraction finished");
        }

        let text = match shape {
            OutputShape::Raw => document.clone(),
            _ => found.text,
        };
        Ok(BrowserPage {
            status: 200,
            final_url,
            text,
            plain: found.plain,
            method,
            html: document,
            title,
            degraded,
            verdict,
            spa,
            settle,
            strategies_tried: run.attempted,
        })
    }

    async fn detect_spa(&self, session: &dyn BrowserSession, url: &Url, initial: &str) -> (SpaAssessment, Option<String>) {
        let live = match session.evaluate(SPA_SIGNALS_SCRIPT).await {
            Ok(Value::String(raw)) => serde_json::from_str::<SpaSignals>(&raw).ok(),
            Ok(other) => serde_json::from_value::<SpaSignals>(other).ok(),
            Err(e) => {
                debug!(error = %e, "SPA signal script failed, reading markup instead");
                None
            }
        };
        let mut signals = live.unwrap_or_else(|| SpaSignals::from_html(initial));
        if signals.host.is_empty() {
            signals.host = url.host_str().unwrap_or_default().to_string();
        }
        let title = Some(signals.title.trim().to_string()).filter(|t| !t.is_empty());
        let assessment = signals.assess();
        debug!(
            score = assessment.score,
            fired = ?assessment.fired,
            ultra_score = assessment.ultra_score,
            "SPA rubric"
        );
        (assessment, title)
    }
}

async fn live_extras(session: &dyn BrowserSession) -> LiveExtras {
    let parsed = match session.evaluate(LIVE_EXTRAS_SCRIPT).await {
        Ok(Value::String(raw)) => serde_json::from_str(&raw).map_err(|e| e.to_string()),
        Ok(other) => serde_json::from_value(other).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    parsed.unwrap_or_else(|e| {
        debug!(error = %e, "live extras unavailable");
        LiveExtras::default()
    })
}
