use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::RetrySettings;
use crate::error::FetchError;
use crate::model::{AttemptOutcome, FetchAttempt, FetchPath};
use crate::proxy::{ProxyEntry, ProxyPool};

/// Decides whether a failure deserves another attempt.
pub type Classifier = fn(&FetchError) -> bool;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            base: settings.base_delay,
            max: settings.max_delay,
            jitter: settings.jitter.clamp(0.0, 0.9),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)` plus up to
    /// `jitter` of that again, never above `max`. `sample` is in `[0, 1)`.
    pub fn delay(&self, attempt: u32, sample: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.as_secs_f64() * f64::from(1u32 << exp);
        let jittered = raw * (1.0 + self.jitter * sample.clamp(0.0, 1.0));
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
    }
}

/// Result of running one fetch path through the controller.
pub struct RetryReport<T> {
    pub result: Result<T, FetchError>,
    pub proxy: Option<String>,
    pub attempts: Vec<FetchAttempt>,
}

/// Drives a fetch operation across proxies with exponential backoff.
///
/// The attempt ceiling counts every attempt, including the direct-connection
/// fallback: once only one slot is left and no direct attempt has been made,
/// that slot goes to a direct connection.
pub struct RetryController {
    max_attempts: u32,
    backoff: Backoff,
    classify: Classifier,
}

impl RetryController {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: Backoff::new(settings),
            classify: FetchError::is_transient,
        }
    }

    pub fn with_classifier(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }

    /// Runs `op` until it succeeds, fails fatally, runs out of attempts or the
    /// deadline passes. `op` receives the proxy address to use (or `None` for
    /// direct) and the time left before the deadline.
    ///
    /// When the next backoff would overrun the deadline and no direct attempt
    /// has been made yet, the direct attempt runs immediately instead.
    pub async fn run<T, F, Fut>(
        &self,
        path: FetchPath,
        pool: &ProxyPool,
        deadline: Instant,
        mut op: F,
    ) -> RetryReport<T>
    where
        F: FnMut(Option<String>, Duration) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempts: Vec<FetchAttempt> = Vec::new();
        let mut tried_direct = false;
        let mut delay_before = Duration::ZERO;
        let mut last_error = FetchError::timeout_after(Duration::ZERO);
        let mut direct_now = false;

        for attempt in 1..=self.max_attempts {
            let now = Instant::now();
            if now >= deadline {
                warn!(?path, attempt, "budget exhausted before attempt");
                if attempts.is_empty() {
                    last_error = FetchError::Timeout("request budget exhausted".to_string());
                }
                break;
            }
            let remaining = deadline - now;

            let last_slot = attempt == self.max_attempts;
            let entry: Option<Arc<ProxyEntry>> = if (last_slot || direct_now) && !tried_direct {
                None
            } else {
                pool.select()
            };
            let proxy = entry.as_ref().map(|e| e.address.clone());
            if proxy.is_none() {
                tried_direct = true;
            }

            debug!(?path, attempt, proxy = ?proxy, "starting fetch attempt");
            let started = Instant::now();
            let result = op(proxy.clone(), remaining).await;
            let elapsed = started.elapsed();

            match result {
                Ok(value) => {
                    if let Some(entry) = &entry {
                        pool.report(entry, true);
                    }
                    attempts.push(FetchAttempt {
                        proxy: proxy.clone(),
                        path,
                        delay_before,
                        elapsed,
                        outcome: AttemptOutcome::Success,
                    });
                    info!(?path, attempt, proxy = ?proxy, elapsed_ms = elapsed.as_millis() as u64, "fetch succeeded");
                    return RetryReport {
                        result: Ok(value),
                        proxy,
                        attempts,
                    };
                }
                Err(err) => {
                    let transient = (self.classify)(&err);
                    if let Some(entry) = &entry {
                        // A fatal answer from the origin says nothing bad about the proxy.
                        pool.report(entry, !transient);
                    }
                    attempts.push(FetchAttempt {
                        proxy: proxy.clone(),
                        path,
                        delay_before,
                        elapsed,
                        outcome: AttemptOutcome::Failed {
                            kind: err.kind(),
                            message: err.to_string(),
                            transient,
                        },
                    });
                    warn!(?path, attempt, proxy = ?proxy, error = %err, transient, "fetch attempt failed");
                    last_error = err;

                    if !transient || attempt == self.max_attempts {
                        break;
                    }

                    delay_before = self.backoff.delay(attempt, rand::thread_rng().gen::<f64>());
                    if Instant::now() + delay_before >= deadline {
                        if tried_direct {
                            warn!(?path, delay_ms = delay_before.as_millis() as u64, "backoff would overrun budget");
                            break;
                        }
                        warn!(
                            ?path,
                            delay_ms = delay_before.as_millis() as u64,
                            "backoff would overrun budget, trying direct connection now"
                        );
                        delay_before = Duration::ZERO;
                        direct_now = true;
                        continue;
                    }
                    sleep(delay_before).await;
                }
            }
        }

        RetryReport {
            result: Err(last_error),
            proxy: None,
            attempts,
        }
    }
}
