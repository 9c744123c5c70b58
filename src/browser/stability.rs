//! DOM settle detection for client-rendered pages.

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use super::BrowserSession;

/// Installs a page-wide mutation counter once per document.
pub const MUTATION_OBSERVER_SCRIPT: &str = r#"
(() => {
    if (window.__extractorMutations) return true;
    const state = { count: 0, observer: null };
    window.__extractorMutations = state;
    const target = document.documentElement || document;
    state.observer = new MutationObserver((records) => {
        state.count += records.length;
    });
    state.observer.observe(target, { childList: true, subtree: true, attributes: true, characterData: true });
    return true;
})()
"#;

/// Returns mutations seen since the previous read and resets the counter; -1 if the observer is gone.
pub const MUTATION_COUNT_SCRIPT: &str = r#"
(() => {
    const state = window.__extractorMutations;
    if (!state) return -1;
    const seen = state.count;
    state.count = 0;
    return seen;
})()
"#;

/// Stops the counter and removes it from the page.
pub const MUTATION_DISCONNECT_SCRIPT: &str = r#"
(() => {
    const state = window.__extractorMutations;
    if (state && state.observer) state.observer.disconnect();
    delete window.__extractorMutations;
    return true;
})()
"#;

/// Counts consecutive quiet windows. A window is quiet when it saw no more
/// than `tolerance` mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityTracker {
    required: u32,
    tolerance: u64,
    quiet: u32,
}

impl StabilityTracker {
    pub fn new(required: u32, tolerance: u64) -> Self {
        Self {
            required: required.max(1),
            tolerance,
            quiet: 0,
        }
    }

    /// Feeds one window's mutation count; true once enough quiet windows ran back to back.
    pub fn observe(&mut self, mutations: u64) -> bool {
        if mutations <= self.tolerance {
            self.quiet += 1;
        } else {
            self.quiet = 0;
        }
        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        self.quiet >= self.required
    }

    pub fn reset(&mut self) {
        self.quiet = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Mutations stayed under tolerance for the required run of windows.
    Stable { waited: Duration },
    /// The settle ceiling or request deadline cut the wait short.
    Ceiling { waited: Duration },
    /// Fixed idle wait used for pages that are not client-rendered.
    Idle { waited: Duration },
}

impl SettleOutcome {
    pub fn waited(&self) -> Duration {
        match *self {
            SettleOutcome::Stable { waited } | SettleOutcome::Ceiling { waited } | SettleOutcome::Idle { waited } => {
                waited
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlePolicy {
    pub quiet_period: Duration,
    pub quiet_windows: u32,
    pub tolerance: u64,
    pub ceiling: Duration,
}

/// Fixed wait, cut short by the deadline.
pub async fn idle_wait(wait: Duration, deadline: Instant) -> SettleOutcome {
    let started = Instant::now();
    sleep_until((started + wait).min(deadline)).await;
    SettleOutcome::Idle {
        waited: started.elapsed(),
    }
}

/// Polls the mutation counter once per quiet period until the page settles,
/// the ceiling is hit or the deadline passes. The observer is disconnected
/// before returning.
pub async fn wait_for_stability(session: &dyn BrowserSession, policy: SettlePolicy, deadline: Instant) -> SettleOutcome {
    let started = Instant::now();
    let limit = (started + policy.ceiling).min(deadline);

    if let Err(e) = session.evaluate(MUTATION_OBSERVER_SCRIPT).await {
        warn!(error = %e, "could not install mutation observer, using quiet period as idle wait");
        sleep(policy.quiet_period.min(limit.saturating_duration_since(started))).await;
        return SettleOutcome::Ceiling {
            waited: started.elapsed(),
        };
    }

    let outcome = poll_until_settled(session, policy, started, limit).await;
    if let Err(e) = session.evaluate(MUTATION_DISCONNECT_SCRIPT).await {
        debug!(error = %e, "mutation observer disconnect failed");
    }
    outcome
}

async fn poll_until_settled(
    session: &dyn BrowserSession,
    policy: SettlePolicy,
    started: Instant,
    limit: Instant,
) -> SettleOutcome {
    let mut tracker = StabilityTracker::new(policy.quiet_windows, policy.tolerance);
    loop {
        let next = Instant::now() + policy.quiet_period;
        if next > limit {
            debug!(waited_ms = started.elapsed().as_millis() as u64, "settle ceiling reached");
            return SettleOutcome::Ceiling {
                waited: started.elapsed(),
            };
        }
        sleep_until(next).await;

        let seen = session
            .evaluate(MUTATION_COUNT_SCRIPT)
            .await
            .ok()
            .and_then(|v| v.as_i64())
            .unwrap_or(-1);
        if seen < 0 {
            // Document was replaced; the counter went with it.
            let _ = session.evaluate(MUTATION_OBSERVER_SCRIPT).await;
            tracker.reset();
            continue;
        }

        debug!(mutations = seen, "settle window");
        if tracker.observe(seen as u64) {
            return SettleOutcome::Stable {
                waited: started.elapsed(),
            };
        }
    }
}
