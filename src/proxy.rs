//! Egress proxy pools.
//!
//! The process-wide pool holds only the operator's seed list. Proxies a caller
//! supplies with a request get a pool of their own that lives as long as that
//! request, so one caller's route is never used for another caller's traffic.
//!
//! Entries are only ever mutated through [`ProxyPool::report`]. Counters are
//! atomics; the only lock is the per-entry disable timestamp.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::config::ProxySettings;

/// Scheme-qualified proxy URL; bare `host:port` entries are HTTP proxies.
pub fn proxy_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[derive(Debug)]
pub struct ProxyEntry {
    pub address: String,
    consecutive_failures: AtomicU32,
    /// Unix micros of the last selection, 0 when never used.
    last_used: AtomicI64,
    successes: AtomicU64,
    failures: AtomicU64,
    disabled_since: Mutex<Option<Instant>>,
}

impl ProxyEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            consecutive_failures: AtomicU32::new(0),
            last_used: AtomicI64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            disabled_since: Mutex::new(None),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let ok = self.successes.load(Ordering::Relaxed) as f64;
        let total = ok + self.failures.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            1.0
        } else {
            ok / total
        }
    }

    fn is_eligible(&self, now: Instant, cooldown: Duration) -> bool {
        match *self.disabled_since.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(since) => now.duration_since(since) >= cooldown,
            None => true,
        }
    }

    fn mark_used(&self) {
        self.last_used.store(Utc::now().timestamp_micros(), Ordering::Relaxed);
    }

    fn info(&self, now: Instant, cooldown: Duration) -> ProxyInfo {
        let last = self.last_used.load(Ordering::Relaxed);
        ProxyInfo {
            address: self.address.clone(),
            consecutive_failures: self.consecutive_failures(),
            eligible: self.is_eligible(now, cooldown),
            success_rate: self.success_rate(),
            last_used: (last != 0)
                .then(|| Utc.timestamp_micros(last).single())
                .flatten()
                .map(|ts| crate::model::format_timestamp(&ts)),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProxyInfo {
    pub address: String,
    pub consecutive_failures: u32,
    pub eligible: bool,
    pub success_rate: f64,
    pub last_used: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProxyStats {
    pub total: usize,
    pub eligible: usize,
    pub disabled: usize,
    pub proxies: Vec<ProxyInfo>,
}

pub struct ProxyPool {
    entries: RwLock<Vec<Arc<ProxyEntry>>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl ProxyPool {
    /// Process-wide pool seeded from the operator's configuration.
    pub fn new(settings: &ProxySettings) -> Self {
        let pool = Self::with_addresses(&settings.seed, settings);
        if !pool.is_empty() {
            info!(proxies = pool.len(), "seeded proxy pool");
        }
        pool
    }

    /// Pool over exactly `addresses`, duplicates dropped, with the configured health policy.
    pub fn with_addresses(addresses: &[String], settings: &ProxySettings) -> Self {
        let mut entries: Vec<Arc<ProxyEntry>> = Vec::with_capacity(addresses.len());
        for address in addresses.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            if !entries.iter().any(|e| e.address == address) {
                entries.push(Arc::new(ProxyEntry::new(address.to_string())));
            }
        }
        Self {
            entries: RwLock::new(entries),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: settings.cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uniformly random eligible entry, or `None` when every entry is cooling down.
    pub fn select(&self) -> Option<Arc<ProxyEntry>> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let eligible: Vec<&Arc<ProxyEntry>> = entries
            .iter()
            .filter(|e| e.is_eligible(now, self.cooldown))
            .collect();

        let chosen = eligible.choose(&mut rand::thread_rng()).map(|e| Arc::clone(e))?;
        chosen.mark_used();
        Some(chosen)
    }

    pub fn report(&self, entry: &ProxyEntry, success: bool) {
        if success {
            entry.successes.fetch_add(1, Ordering::Relaxed);
            entry.consecutive_failures.store(0, Ordering::Relaxed);
            *entry.disabled_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
            return;
        }

        entry.failures.fetch_add(1, Ordering::Relaxed);
        let streak = entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= self.failure_threshold {
            let mut disabled = entry.disabled_since.lock().unwrap_or_else(|e| e.into_inner());
            // Restart the cooldown even for an entry that was already disabled.
            *disabled = Some(Instant::now());
            warn!(
                proxy = %entry.address,
                streak,
                cooldown_secs = self.cooldown.as_secs(),
                "proxy disabled after repeated failures"
            );
        }
    }

    pub fn stats(&self) -> ProxyStats {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let proxies: Vec<ProxyInfo> = entries.iter().map(|e| e.info(now, self.cooldown)).collect();
        let eligible = proxies.iter().filter(|p| p.eligible).count();
        ProxyStats {
            total: proxies.len(),
            eligible,
            disabled: proxies.len() - eligible,
            proxies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, cooldown: Duration) -> ProxySettings {
        ProxySettings {
            failure_threshold: threshold,
            cooldown,
            seed: Vec::new(),
        }
    }

    fn pool(addresses: &[&str], threshold: u32, cooldown: Duration) -> ProxyPool {
        let addresses: Vec<String> = addresses.iter().map(|s| s.to_string()).collect();
        ProxyPool::with_addresses(&addresses, &settings(threshold, cooldown))
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_entry_is_skipped_until_cooldown() {
        let pool = pool(&["a:1", "b:2"], 2, Duration::from_secs(60));
        let a = loop {
            let picked = pool.select().unwrap();
            if picked.address == "a:1" {
                break picked;
            }
        };
        pool.report(&a, false);
        pool.report(&a, false);

        for _ in 0..50 {
            let picked = pool.select().unwrap();
            assert_eq!(picked.address, "b:2");
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!((0..200).any(|_| pool.select().unwrap().address == "a:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn all_disabled_selects_nothing() {
        let pool = pool(&["a:1"], 1, Duration::from_secs(30));
        let a = pool.select().unwrap();
        pool.report(&a, false);
        assert!(pool.select().is_none());
        assert_eq!(pool.stats().disabled, 1);
    }

    #[test]
    fn success_resets_streak() {
        let pool = pool(&["a:1"], 3, Duration::from_secs(30));
        let a = pool.select().unwrap();
        pool.report(&a, false);
        pool.report(&a, false);
        pool.report(&a, true);
        assert_eq!(a.consecutive_failures(), 0);
        assert!((a.success_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let empty = pool(&[], 3, Duration::from_secs(30));
        assert!(empty.select().is_none());
        let deduped = pool(&["c:3", " c:3 ", ""], 3, Duration::from_secs(30));
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn seeded_pool_only_holds_the_seed() {
        let seeded = ProxyPool::new(&ProxySettings {
            seed: vec!["ops:3128".to_string()],
            ..settings(3, Duration::from_secs(30))
        });
        let _scoped = ProxyPool::with_addresses(&["caller:8080".to_string()], &settings(3, Duration::from_secs(30)));
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded.select().unwrap().address, "ops:3128");
    }
}
