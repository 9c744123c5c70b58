use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Weights of the four quality sub-scores. They need not sum to one; the
/// aggregate is normalised by their total.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityWeights {
    pub readability: f64,
    pub diversity: f64,
    pub structure: f64,
    pub cleanliness: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            readability: 0.25,
            diversity: 0.20,
            structure: 0.25,
            cleanliness: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxySettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Addresses (`host:port`) the pool is seeded with at startup.
    pub seed: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            seed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrowserSettings {
    pub quiet_period: Duration,
    pub quiet_windows: u32,
    /// Mutations per quiet window still counted as quiet.
    pub mutation_tolerance: u64,
    pub settle_ceiling: Duration,
    pub idle_wait: Duration,
    pub navigation_timeout: Duration,
    pub teardown_failure_limit: u32,
    pub idle_process_timeout: Duration,
    /// Live Chrome processes kept at once; the least recently used egress is closed first.
    pub max_processes: usize,
    pub window_size: (u32, u32),
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(500),
            quiet_windows: 3,
            mutation_tolerance: 2,
            settle_ceiling: Duration::from_secs(35),
            idle_wait: Duration::from_millis(1500),
            navigation_timeout: Duration::from_secs(30),
            teardown_failure_limit: 3,
            idle_process_timeout: Duration::from_secs(600),
            max_processes: 4,
            window_size: (1920, 1080),
        }
    }
}

/// Calibration constants and limits for the whole engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub weights: QualityWeights,
    pub quality_threshold: f64,
    pub min_substantial_chars: usize,
    pub min_static_chars: usize,
    pub near_empty_chars: usize,
    pub error_verdict_threshold: f64,
    pub static_budget_share: f64,
    pub teardown_grace: Duration,
    pub retry: RetrySettings,
    pub proxy: ProxySettings,
    pub browser: BrowserSettings,
    pub max_links: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            quality_threshold: 0.45,
            min_substantial_chars: 500,
            min_static_chars: 200,
            near_empty_chars: 20,
            error_verdict_threshold: 0.5,
            static_budget_share: 0.5,
            teardown_grace: Duration::from_secs(2),
            retry: RetrySettings::default(),
            proxy: ProxySettings::default(),
            browser: BrowserSettings::default(),
            max_links: 100,
        }
    }
}

impl ExtractorConfig {
    /// Reads `EXTRACTOR_*` variables on top of the defaults. Call `dotenv()` first
    /// if a `.env` file should be honoured.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            weights: QualityWeights {
                readability: env_or("EXTRACTOR_WEIGHT_READABILITY", d.weights.readability),
                diversity: env_or("EXTRACTOR_WEIGHT_DIVERSITY", d.weights.diversity),
                structure: env_or("EXTRACTOR_WEIGHT_STRUCTURE", d.weights.structure),
                cleanliness: env_or("EXTRACTOR_WEIGHT_CLEANLINESS", d.weights.cleanliness),
            },
            quality_threshold: env_or("EXTRACTOR_QUALITY_THRESHOLD", d.quality_threshold),
            min_substantial_chars: env_or("EXTRACTOR_MIN_SUBSTANTIAL_CHARS", d.min_substantial_chars),
            min_static_chars: env_or("EXTRACTOR_MIN_STATIC_CHARS", d.min_static_chars),
            near_empty_chars: env_or("EXTRACTOR_NEAR_EMPTY_CHARS", d.near_empty_chars),
            error_verdict_threshold: env_or("EXTRACTOR_ERROR_THRESHOLD", d.error_verdict_threshold),
            static_budget_share: env_or("EXTRACTOR_STATIC_BUDGET_SHARE", d.static_budget_share)
                .clamp(0.1, 1.0),
            teardown_grace: env_millis("EXTRACTOR_TEARDOWN_GRACE_MS", d.teardown_grace),
            retry: RetrySettings {
                max_attempts: env_or("EXTRACTOR_RETRY_MAX_ATTEMPTS", d.retry.max_attempts).max(1),
                base_delay: env_millis("EXTRACTOR_RETRY_BASE_DELAY_MS", d.retry.base_delay),
                max_delay: env_millis("EXTRACTOR_RETRY_MAX_DELAY_MS", d.retry.max_delay),
                jitter: env_or("EXTRACTOR_RETRY_JITTER", d.retry.jitter).clamp(0.0, 0.9),
            },
            proxy: ProxySettings {
                failure_threshold: env_or("EXTRACTOR_PROXY_FAILURE_THRESHOLD", d.proxy.failure_threshold)
                    .max(1),
                cooldown: env_millis("EXTRACTOR_PROXY_COOLDOWN_MS", d.proxy.cooldown),
                seed: env::var("EXTRACTOR_PROXIES")
                    .map(|raw| parse_proxy_list(&raw))
                    .unwrap_or_default(),
            },
            browser: BrowserSettings {
                quiet_period: env_millis("EXTRACTOR_QUIET_PERIOD_MS", d.browser.quiet_period),
                quiet_windows: env_or("EXTRACTOR_QUIET_WINDOWS", d.browser.quiet_windows).max(1),
                mutation_tolerance: env_or("EXTRACTOR_MUTATION_TOLERANCE", d.browser.mutation_tolerance),
                settle_ceiling: env_millis("EXTRACTOR_SETTLE_CEILING_MS", d.browser.settle_ceiling),
                idle_wait: env_millis("EXTRACTOR_IDLE_WAIT_MS", d.browser.idle_wait),
                navigation_timeout: env_millis("EXTRACTOR_NAVIGATION_TIMEOUT_MS", d.browser.navigation_timeout),
                teardown_failure_limit: env_or("EXTRACTOR_TEARDOWN_FAILURE_LIMIT", d.browser.teardown_failure_limit)
                    .max(1),
                idle_process_timeout: env_millis("EXTRACTOR_BROWSER_IDLE_MS", d.browser.idle_process_timeout),
                max_processes: env_or("EXTRACTOR_BROWSER_MAX_PROCESSES", d.browser.max_processes).max(1),
                window_size: d.browser.window_size,
            },
            max_links: env_or("EXTRACTOR_MAX_LINKS", d.max_links),
        }
    }
}

/// Splits a comma or whitespace separated `host:port` list.
pub fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    let millis = env_or(key, default.as_millis() as u64);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_lists() {
        assert_eq!(
            parse_proxy_list("10.0.0.1:8080, 10.0.0.2:3128\n10.0.0.3:80"),
            vec!["10.0.0.1:8080", "10.0.0.2:3128", "10.0.0.3:80"]
        );
        assert!(parse_proxy_list("  ").is_empty());
    }

    #[test]
    fn unparsable_values_fall_back() {
        env::set_var("EXTRACTOR_TEST_BOGUS_NUMBER", "twelve");
        assert_eq!(env_or("EXTRACTOR_TEST_BOGUS_NUMBER", 12u32), 12);
        env::set_var("EXTRACTOR_TEST_MILLIS", "250");
        assert_eq!(
            env_millis("EXTRACTOR_TEST_MILLIS", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
    }
}
