//! Headless Chrome backend.
//!
//! One Chrome process per egress (a proxy address or direct) is shared
//! across requests, up to a configured number of processes. Every request gets its own browser context and tab inside
//! that process, so cookies and storage never leak between requests. A process
//! whose contexts keep failing to tear down is dropped and relaunched on the
//! next request.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::{Page, Target};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{BrowserBackend, BrowserSession};
use crate::config::BrowserSettings;
use crate::error::{FetchError, TeardownError};
use crate::html::random_user_agent;
use crate::proxy::proxy_url;

const DIRECT: &str = "direct";

/// Injected before any page script runs.
pub const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 4 });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) return 'Intel Inc.';
        if (parameter === 37446) return 'Intel Iris OpenGL Engine';
        return getParameter.apply(this, [parameter]);
    };
    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAction {
    Keep,
    Recycle,
}

/// Counts consecutive teardown failures of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownBreaker {
    threshold: u32,
    consecutive: u32,
}

impl TeardownBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record(&mut self, ok: bool) -> BreakerAction {
        if ok {
            self.consecutive = 0;
            return BreakerAction::Keep;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            BreakerAction::Recycle
        } else {
            BreakerAction::Keep
        }
    }
}

struct Process {
    /// Launch slot; `None` until the first caller for this egress launches Chrome.
    slot: Arc<Mutex<Option<Browser>>>,
    breaker: TeardownBreaker,
    last_used: Instant,
}

struct ChromePool {
    settings: BrowserSettings,
    processes: Mutex<HashMap<String, Process>>,
}

/// Keys to close so that at most `cap` remain, least recently used first. `keep` is never chosen.
fn lru_victims<'a>(last_used: impl Iterator<Item = (&'a str, Instant)>, keep: &str, cap: usize) -> Vec<String> {
    let mut entries: Vec<(&str, Instant)> = last_used.collect();
    let excess = entries.len().saturating_sub(cap.max(1));
    entries.retain(|(key, _)| *key != keep);
    entries.sort_by_key(|(_, at)| *at);
    entries.into_iter().take(excess).map(|(key, _)| key.to_string()).collect()
}

impl ChromePool {
    fn launch(&self, proxy: Option<&str>) -> anyhow::Result<Browser> {
        let user_agent = random_user_agent();
        debug!(user_agent, "launching browser");

        let mut args = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--window-position=0,0"),
            OsStr::new("--ignore-certificate-errors"),
        ];
        let ua_arg = format!("--user-agent={user_agent}");
        args.push(OsStr::new(&ua_arg));
        let proxy_arg = proxy.map(|p| format!("--proxy-server={}", proxy_url(p)));
        if let Some(arg) = &proxy_arg {
            args.push(OsStr::new(arg));
        }

        Browser::new(LaunchOptions {
            headless: true,
            window_size: Some(self.settings.window_size),
            idle_browser_timeout: self.settings.idle_process_timeout,
            args,
            ..Default::default()
        })
    }

    /// Reserves the slot for `key` under the map lock, then launches (if needed) under the
    /// slot's own lock, so launches for different egresses run in parallel.
    fn browser_for(&self, key: &str, proxy: Option<&str>) -> Result<Browser, FetchError> {
        let slot = {
            let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
            let process = processes.entry(key.to_string()).or_insert_with(|| Process {
                slot: Arc::new(Mutex::new(None)),
                breaker: TeardownBreaker::new(self.settings.teardown_failure_limit),
                last_used: Instant::now(),
            });
            process.last_used = Instant::now();
            let slot = Arc::clone(&process.slot);

            let victims = lru_victims(
                processes.iter().map(|(k, p)| (k.as_str(), p.last_used)),
                key,
                self.settings.max_processes,
            );
            for victim in victims {
                processes.remove(&victim);
                info!(egress = %victim, "browser process closed to stay under the process cap");
            }
            slot
        };

        let mut launched = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(browser) = launched.as_ref() {
            return Ok(browser.clone());
        }
        match self.launch(proxy) {
            Ok(browser) => {
                info!(egress = key, "browser process started");
                *launched = Some(browser.clone());
                Ok(browser)
            }
            Err(e) => {
                drop(launched);
                self.evict_slot(key, &slot);
                Err(FetchError::Launch(e.to_string()))
            }
        }
    }

    /// Removes `key` only while it still refers to `slot`.
    fn evict_slot(&self, key: &str, slot: &Arc<Mutex<Option<Browser>>>) {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        if processes.get(key).is_some_and(|p| Arc::ptr_eq(&p.slot, slot)) {
            processes.remove(key);
            info!(egress = key, "browser process discarded");
        }
    }

    fn evict(&self, key: &str) {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        if processes.remove(key).is_some() {
            info!(egress = key, "browser process discarded");
        }
    }

    fn record_teardown(&self, key: &str, ok: bool) {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(process) = processes.get_mut(key) else {
            return;
        };
        if process.breaker.record(ok) == BreakerAction::Recycle {
            warn!(egress = key, "repeated teardown failures, recycling browser process");
            processes.remove(key);
        }
    }

    fn open_blocking(self: &Arc<Self>, proxy: Option<String>) -> Result<ChromeSession, FetchError> {
        let key = proxy.clone().unwrap_or_else(|| DIRECT.to_string());
        let mut last_error = String::new();

        // A dead process shows up as a context failure; relaunch once.
        for _ in 0..2 {
            let browser = self.browser_for(&key, proxy.as_deref())?;
            match open_context(&browser) {
                Ok((context_id, tab)) => {
                    if let Err(e) = prepare_tab(&tab, self.settings.navigation_timeout) {
                        warn!(egress = %key, error = %e, "stealth setup failed, continuing without it");
                    }
                    debug!(egress = %key, context = %context_id, "browser context opened");
                    return Ok(ChromeSession {
                        pool: Arc::clone(self),
                        key,
                        browser,
                        context_id,
                        tab,
                        closed: false,
                    });
                }
                Err(e) => {
                    warn!(egress = %key, error = %e, "could not open browser context");
                    last_error = e.to_string();
                    self.evict(&key);
                }
            }
        }
        Err(FetchError::Launch(last_error))
    }
}

fn open_context(browser: &Browser) -> anyhow::Result<(String, Arc<Tab>)> {
    let context = browser.new_context()?;
    let tab = context.new_tab()?;
    Ok((context.get_id().to_string(), tab))
}

fn prepare_tab(tab: &Tab, timeout: Duration) -> anyhow::Result<()> {
    tab.set_default_timeout(timeout);
    tab.enable_debugger()?;
    tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
        source: STEALTH_SCRIPT.to_string(),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })?;
    Ok(())
}

/// Closes the page, then disposes its context through another tab of the same
/// process. Without another tab, disposing through the page itself also closes it.
fn teardown(tab: &Arc<Tab>, browser: &Browser, context_id: String) -> Result<(), TeardownError> {
    let dispose = Target::DisposeBrowserContext {
        browser_context_id: context_id,
    };
    let relay = browser.get_tabs().lock().ok().and_then(|tabs| {
        tabs.iter()
            .find(|other| other.get_target_id() != tab.get_target_id())
            .cloned()
    });

    let disposed = match relay {
        Some(relay) => {
            if let Err(e) = tab.close(false) {
                debug!(error = %e, "tab close failed, disposing context anyway");
            }
            relay.call_method(dispose)
        }
        None => tab.call_method(dispose),
    };
    disposed.map(|_| ()).map_err(|e| TeardownError {
        resource: "browser context",
        message: e.to_string(),
    })
}

async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Navigation(format!("browser task aborted: {e}")))?
}

pub struct ChromeSession {
    pool: Arc<ChromePool>,
    key: String,
    browser: Browser,
    context_id: String,
    tab: Arc<Tab>,
    closed: bool,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &Url, timeout: Duration) -> Result<(), FetchError> {
        let tab = Arc::clone(&self.tab);
        let target = url.to_string();
        blocking(move || {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target)
                .and_then(|t| t.wait_until_navigated())
                .map_err(|e| FetchError::Navigation(e.to_string()))?;
            if let Err(e) = tab.wait_for_element_with_custom_timeout("body", timeout) {
                debug!(url = %target, error = %e, "body did not appear");
            }
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, FetchError> {
        let tab = Arc::clone(&self.tab);
        let script = script.to_string();
        blocking(move || {
            tab.evaluate(&script, false)
                .map(|object| object.value.unwrap_or(Value::Null))
                .map_err(|e| FetchError::Navigation(format!("script evaluation failed: {e}")))
        })
        .await
    }

    async fn content(&self) -> Result<String, FetchError> {
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            tab.get_content()
                .map_err(|e| FetchError::Navigation(format!("could not read page content: {e}")))
        })
        .await
    }

    async fn current_url(&self) -> Result<String, FetchError> {
        let tab = Arc::clone(&self.tab);
        blocking(move || Ok(tab.get_url())).await
    }

    async fn close(self: Box<Self>) -> Result<(), TeardownError> {
        let mut session = self;
        session.closed = true;
        let tab = Arc::clone(&session.tab);
        let browser = session.browser.clone();
        let context_id = session.context_id.clone();

        let result = tokio::task::spawn_blocking(move || teardown(&tab, &browser, context_id))
            .await
            .unwrap_or_else(|e| {
                Err(TeardownError {
                    resource: "browser context",
                    message: e.to_string(),
                })
            });
        session.pool.record_teardown(&session.key, result.is_ok());
        result
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped mid-flight (request cancelled); close in the background.
        let tab = Arc::clone(&self.tab);
        let browser = self.browser.clone();
        let context_id = self.context_id.clone();
        let pool = Arc::clone(&self.pool);
        let key = self.key.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                let result = teardown(&tab, &browser, context_id);
                if let Err(e) = &result {
                    warn!(egress = %key, error = %e, "background teardown failed");
                }
                pool.record_teardown(&key, result.is_ok());
            });
        }
    }
}

/// Pooled headless Chrome.
#[derive(Clone)]
pub struct ChromeBackend {
    pool: Arc<ChromePool>,
}

impl ChromeBackend {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            pool: Arc::new(ChromePool {
                settings,
                processes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of live browser processes.
    pub fn process_count(&self) -> usize {
        self.pool.processes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl BrowserBackend for ChromeBackend {
    async fn open_session(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, FetchError> {
        let pool = Arc::clone(&self.pool);
        let proxy = proxy.map(str::to_string);
        let session = tokio::task::spawn_blocking(move || pool.open_blocking(proxy))
            .await
            .map_err(|e| FetchError::Launch(format!("browser launch aborted: {e}")))??;
        Ok(Box::new(session))
    }

    fn is_available(&self) -> bool {
        headless_chrome::browser::default_executable().is_ok()
    }
}
