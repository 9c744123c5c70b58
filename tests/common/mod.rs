#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use text_extractor::browser::stability::MUTATION_COUNT_SCRIPT;
use text_extractor::browser::{BrowserBackend, BrowserSession};
use text_extractor::config::{ExtractorConfig, RetrySettings};
use text_extractor::convert::{ConversionLimits, FileConverter};
use text_extractor::error::{ConversionError, FetchError, TeardownError};
use text_extractor::links::AnchorLinkExtractor;
use text_extractor::proxy::ProxyPool;
use text_extractor::spa::SPA_SIGNALS_SCRIPT;
use text_extractor::static_fetch::{HttpTransport, RawResponse};
use text_extractor::Orchestrator;

// ============================================================================
// HTTP transport
// ============================================================================

#[derive(Debug, Clone)]
pub enum Reply {
    Page { status: u16, content_type: String, body: Vec<u8> },
    Fail(FetchError),
    Hang,
}

impl Reply {
    pub fn html(body: &str) -> Self {
        Reply::Page {
            status: 200,
            content_type: "text/html; charset=utf-8".to_string(),
            body: body.as_bytes().to_vec(),
        }
    }
}

pub struct MockTransport {
    replies: Arc<Mutex<Vec<Reply>>>,
    fallback: Reply,
    calls: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(Vec::new())),
            fallback: Reply::Fail(FetchError::Connection("no scripted reply".to_string())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_reply(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push(reply);
        self
    }

    /// Reply used once the scripted queue is empty.
    pub fn always(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    /// Proxy used by each call, in order.
    pub fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, url: &Url, proxy: Option<&str>, _timeout: Duration) -> Result<RawResponse, FetchError> {
        self.calls.lock().unwrap().push(proxy.map(str::to_string));
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                self.fallback.clone()
            } else {
                replies.remove(0)
            }
        };
        match reply {
            Reply::Page {
                status,
                content_type,
                body,
            } => Ok(RawResponse {
                status,
                final_url: url.to_string(),
                content_type: Some(content_type),
                body,
            }),
            Reply::Fail(e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(FetchError::Connection("hung".to_string()))
            }
        }
    }
}

// ============================================================================
// Browser
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BrowserLog {
    pub opened: usize,
    pub closed: usize,
    pub scripts: Vec<String>,
}

impl BrowserLog {
    pub fn count_polls(&self) -> usize {
        self.scripts.iter().filter(|s| s.as_str() == MUTATION_COUNT_SCRIPT).count()
    }
}

pub struct MockBrowser {
    html: String,
    signals: Value,
    mutations: Vec<i64>,
    launch_error: Option<FetchError>,
    log: Arc<Mutex<BrowserLog>>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            html: "<html><body></body></html>".to_string(),
            signals: Value::Null,
            mutations: Vec::new(),
            launch_error: None,
            log: Arc::new(Mutex::new(BrowserLog::default())),
        }
    }

    pub fn with_page(mut self, html: &str) -> Self {
        self.html = html.to_string();
        self
    }

    /// SPA signal answer, as the JSON string the page script returns.
    pub fn with_signals(mut self, json: &str) -> Self {
        self.signals = Value::String(json.to_string());
        self
    }

    pub fn with_mutations(mut self, counts: &[i64]) -> Self {
        self.mutations = counts.to_vec();
        self
    }

    pub fn failing_launch(mut self, error: FetchError) -> Self {
        self.launch_error = Some(error);
        self
    }

    pub fn log(&self) -> BrowserLog {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserBackend for MockBrowser {
    async fn open_session(&self, _proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, FetchError> {
        if let Some(e) = &self.launch_error {
            return Err(e.clone());
        }
        self.log.lock().unwrap().opened += 1;
        Ok(Box::new(MockSession {
            html: self.html.clone(),
            signals: self.signals.clone(),
            mutations: Mutex::new(self.mutations.clone()),
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockSession {
    html: String,
    signals: Value,
    mutations: Mutex<Vec<i64>>,
    log: Arc<Mutex<BrowserLog>>,
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn navigate(&self, _url: &Url, _timeout: Duration) -> Result<(), FetchError> {
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, FetchError> {
        self.log.lock().unwrap().scripts.push(script.to_string());
        if script == SPA_SIGNALS_SCRIPT {
            return Ok(self.signals.clone());
        }
        if script == MUTATION_COUNT_SCRIPT {
            let mut counts = self.mutations.lock().unwrap();
            let next = if counts.is_empty() { 0 } else { counts.remove(0) };
            return Ok(Value::from(next));
        }
        Ok(Value::Bool(true))
    }

    async fn content(&self) -> Result<String, FetchError> {
        Ok(self.html.clone())
    }

    async fn current_url(&self) -> Result<String, FetchError> {
        Ok("https://app.example.com/".to_string())
    }

    async fn close(self: Box<Self>) -> Result<(), TeardownError> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

// ============================================================================
// Converter
// ============================================================================

pub struct MockConverter {
    reply: Result<String, ConversionError>,
    hang: bool,
    calls: Arc<Mutex<usize>>,
}

impl MockConverter {
    pub fn new(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            hang: false,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing(error: ConversionError) -> Self {
        Self {
            reply: Err(error),
            ..Self::new("")
        }
    }

    /// Never finishes on its own.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl FileConverter for MockConverter {
    async fn convert(&self, _bytes: &[u8], _format: &str, _limits: ConversionLimits) -> Result<String, ConversionError> {
        *self.calls.lock().unwrap() += 1;
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.reply.clone()
    }
}

// ============================================================================
// Wiring and fixtures
// ============================================================================

pub fn test_config() -> ExtractorConfig {
    ExtractorConfig {
        retry: RetrySettings {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: 0.25,
        },
        ..ExtractorConfig::default()
    }
}

pub fn orchestrator(transport: &Arc<MockTransport>, browser: Option<&Arc<MockBrowser>>) -> Orchestrator {
    orchestrator_with(
        transport,
        browser,
        Arc::new(MockConverter::new("Converted document text about harbour logistics.")),
    )
}

pub fn orchestrator_with(
    transport: &Arc<MockTransport>,
    browser: Option<&Arc<MockBrowser>>,
    converter: Arc<MockConverter>,
) -> Orchestrator {
    let config = test_config();
    let pool = Arc::new(ProxyPool::new(&config.proxy));
    let transport: Arc<dyn HttpTransport> = transport.clone();
    let browser = browser.map(|b| {
        let backend: Arc<dyn BrowserBackend> = b.clone();
        backend
    });
    Orchestrator::new(
        config,
        pool,
        transport,
        browser,
        converter,
        Arc::new(AnchorLinkExtractor::default()),
    )
}

const PARAGRAPHS: &[&str] = &[
    "The old harbour of Kessling was rebuilt after the great storm of 1887, when most of the wooden piers were washed into the bay. Merchants financed the new stone quays within a decade.",
    "Fishing families moved their boats to the sheltered northern basin. Their catch of herring and cod supplied markets as far inland as the river towns, where salted fish was traded for grain.",
    "In the twentieth century the port turned toward passenger traffic. Ferries to the islands left twice a day in summer, and a small railway line carried visitors from the station to the quay.",
    "Today the harbour museum keeps logbooks, charts and photographs from every period. Volunteers restore a steam tug that once towed cargo ships through the narrow entrance channel.",
    "Local schools visit the museum each spring. Children learn to tie knots, read tide tables and identify the signal flags that pilots used before radio became common on small vessels.",
    "Researchers from the university have mapped the sunken remains of the original piers. Their surveys show timber foundations preserved in the cold silt, along with pottery and coins.",
    "The town council plans a new walking route along the waterfront. Benches, information boards and a lookout tower will let residents follow the history of the harbour on foot.",
    "Each August a festival celebrates the rebuilding with music, rowing races and a parade of restored boats. Thousands of guests arrive, and the quays stay busy until late at night.",
];

/// A well-structured article of roughly 3000 characters.
pub fn article_html() -> String {
    let body: String = PARAGRAPHS
        .iter()
        .chain(PARAGRAPHS.iter().take(8))
        .take(16)
        .enumerate()
        .map(|(i, p)| {
            if i % 4 == 0 {
                format!("<h2>Chapter {}</h2><p>{}</p>", i / 4 + 1, p)
            } else {
                format!("<p>{p}</p>")
            }
        })
        .collect();
    format!(
        "<html><head><title>The harbour of Kessling</title></head><body>\
         <nav><a href=\"/\">Home</a> <a href=\"/about\">About</a></nav>\
         <article><h1>The harbour of Kessling</h1>{body}\
         <p><a href=\"https://museum.example.org/visit\">Read more about visiting</a></p></article>\
         <footer>Town archive</footer></body></html>"
    )
}

pub fn pdf_reply() -> Reply {
    Reply::Page {
        status: 200,
        content_type: "application/pdf".into(),
        body: b"%PDF-1.7 binary".to_vec(),
    }
}

/// HTML for a client-rendered shell with no server-side text.
pub fn placeholder_html() -> String {
    "<html><head><title></title><script src=\"/static/js/main.js\"></script></head>\
     <body><div id=\"root\"></div></body></html>"
        .to_string()
}
