//! Plain HTTP fetch path.

use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use tracing::{debug, info, warn};
use url::Url;

use crate::convert::{self, ConversionInfo, ConversionLimits, FileConverter};
use crate::error::{ConversionError, FetchError};
use crate::html::{self, random_user_agent};
use crate::model::{ExtractionMethod, ExtractionRequest, OutputShape};
use crate::proxy::proxy_url;

/// What the transport hands back before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url, proxy: Option<&str>, timeout: Duration) -> Result<RawResponse, FetchError>;
}

/// `reqwest` transport. A client is built per call so each attempt can use its own proxy.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport;

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url, proxy: Option<&str>, timeout: Duration) -> Result<RawResponse, FetchError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(random_user_agent())
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true);
        if let Some(address) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url(address))?);
        }
        let client = builder.build()?;

        let resp = client
            .get(url.clone())
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();

        debug!(url = %url, status, bytes = body.len(), "static response received");
        Ok(RawResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

/// Decompresses gzip bodies the transport left alone, then decodes as UTF-8
/// or, failing that, Latin-1.
pub fn decode_body(body: &[u8]) -> Result<String, FetchError> {
    let bytes: Cow<'_, [u8]> = if body.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| FetchError::Decode(format!("gzip: {e}")))?;
        Cow::Owned(out)
    } else {
        Cow::Borrowed(body)
    };

    if bytes.iter().take(1024).any(|b| *b == 0) {
        return Err(FetchError::Decode("body is binary, not text".to_string()));
    }

    Ok(match String::from_utf8(bytes.into_owned()) {
        Ok(text) => text,
        Err(e) => e.into_bytes().iter().map(|&b| char::from(b)).collect(),
    })
}

/// Text chosen by the tier policy.
#[derive(Debug, Clone, PartialEq)]
pub struct TieredText {
    /// Text in the requested output shape.
    pub text: String,
    pub plain: String,
    pub method: ExtractionMethod,
}

/// Structured, then generic HTML-to-text, then regex stripping.
pub fn extract_tiers(
    document: &str,
    url: &Url,
    shape: OutputShape,
    min_chars: usize,
    near_empty_chars: usize,
) -> TieredText {
    let raw = |t: TieredText| match shape {
        OutputShape::Raw => TieredText {
            text: document.to_string(),
            ..t
        },
        _ => t,
    };

    let structured = html::structured_extract(document, url).map(|s| TieredText {
        text: s.shaped(shape).to_string(),
        plain: s.text,
        method: ExtractionMethod::Structured,
    });
    let structured_len = structured.as_ref().map_or(0, |t| t.plain.chars().count());
    if structured_len >= min_chars {
        if let Some(t) = structured {
            return raw(t);
        }
    }

    let generic = html::html_to_text(document);
    let generic_len = generic.chars().count();
    let generic = TieredText {
        text: generic.clone(),
        plain: generic,
        method: ExtractionMethod::HtmlToText,
    };
    if generic_len >= min_chars {
        return raw(generic);
    }

    if structured_len < near_empty_chars && generic_len < near_empty_chars {
        let stripped = html::regex_strip(document);
        return raw(TieredText {
            text: stripped.clone(),
            plain: stripped,
            method: ExtractionMethod::RegexStrip,
        });
    }

    match structured {
        Some(t) if structured_len >= generic_len => raw(t),
        _ => raw(generic),
    }
}

/// Result of one successful static attempt.
#[derive(Debug, Clone)]
pub struct StaticPage {
    pub status: u16,
    pub final_url: String,
    pub text: String,
    pub plain: String,
    pub method: ExtractionMethod,
    pub html: Option<String>,
    pub conversion: Option<ConversionInfo>,
}

pub struct StaticFetcher {
    transport: Arc<dyn HttpTransport>,
    converter: Arc<dyn FileConverter>,
    min_chars: usize,
    near_empty_chars: usize,
}

impl StaticFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        converter: Arc<dyn FileConverter>,
        min_chars: usize,
        near_empty_chars: usize,
    ) -> Self {
        Self {
            transport,
            converter,
            min_chars,
            near_empty_chars,
        }
    }

    /// One attempt: fetch, convert or decode, run the tiers.
    pub async fn fetch(
        &self,
        request: &ExtractionRequest,
        url: &Url,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<StaticPage, FetchError> {
        let resp = match tokio::time::timeout(timeout, self.transport.get(url, proxy, timeout)).await {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::timeout_after(timeout)),
        };

        if resp.status >= 500 {
            return Err(FetchError::Http5xx(resp.status));
        }
        if resp.status >= 400 {
            return Err(FetchError::Http4xx(resp.status));
        }

        if request.convert_files {
            if let Some(format) = convert::detect_format(resp.content_type.as_deref(), &resp.final_url) {
                return self.convert(request, &resp, format).await.map_err(|e| {
                    warn!(url = %resp.final_url, format, error_kind = e.kind(), error = %e, "conversion failed");
                    FetchError::from(e)
                });
            }
        }

        let document = decode_body(&resp.body)?;
        let final_url = Url::parse(&resp.final_url).unwrap_or_else(|_| url.clone());
        let tiered = extract_tiers(&document, &final_url, request.output, self.min_chars, self.near_empty_chars);
        info!(
            url = %resp.final_url,
            status = resp.status,
            method = tiered.method.as_str(),
            chars = tiered.plain.chars().count(),
            "static extraction finished"
        );

        Ok(StaticPage {
            status: resp.status,
            final_url: resp.final_url,
            text: tiered.text,
            plain: tiered.plain,
            method: tiered.method,
            html: Some(document),
            conversion: None,
        })
    }

    async fn convert(
        &self,
        request: &ExtractionRequest,
        resp: &RawResponse,
        format: &str,
    ) -> Result<StaticPage, ConversionError> {
        let limits = ConversionLimits {
            max_file_size_mb: request.max_file_size_mb,
            timeout: request.conversion_timeout,
        };
        convert::check_size(&resp.body, limits)?;
        let file_size_mb = convert::size_mb(&resp.body);

        let text = tokio::time::timeout(limits.timeout, self.converter.convert(&resp.body, format, limits))
            .await
            .map_err(|_| ConversionError::Timeout(limits.timeout))??;
        if text.trim().is_empty() {
            return Err(ConversionError::Failed(format!("{format} conversion produced no text")));
        }

        info!(url = %resp.final_url, format, file_size_mb, chars = text.chars().count(), "document converted");
        Ok(StaticPage {
            status: resp.status,
            final_url: resp.final_url.clone(),
            plain: text.clone(),
            text,
            method: ExtractionMethod::Converted,
            html: None,
            conversion: Some(ConversionInfo {
                original_format: format.to_string(),
                file_size_mb: (file_size_mb * 100.0).round() / 100.0,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::Mutex;
    use tokio_test::assert_err;

    struct OneResponse(Result<RawResponse, FetchError>);

    #[async_trait]
    impl HttpTransport for OneResponse {
        async fn get(&self, _: &Url, _: Option<&str>, _: Duration) -> Result<RawResponse, FetchError> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingConverter {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl FileConverter for RecordingConverter {
        async fn convert(&self, _: &[u8], format: &str, _: ConversionLimits) -> Result<String, ConversionError> {
            self.calls.lock().unwrap().push(format.to_string());
            if self.fail {
                Err(ConversionError::Failed("broken".into()))
            } else {
                Ok("Quarterly figures rose across every region.".into())
            }
        }
    }

    fn response(status: u16, content_type: &str, body: &[u8]) -> RawResponse {
        RawResponse {
            status,
            final_url: "https://example.com/page".into(),
            content_type: Some(content_type.into()),
            body: body.to_vec(),
        }
    }

    fn fetcher(resp: Result<RawResponse, FetchError>, converter: Arc<RecordingConverter>) -> StaticFetcher {
        StaticFetcher::new(Arc::new(OneResponse(resp)), converter, 200, 20)
    }

    fn url() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[test]
    fn decodes_gzip_magic_without_header() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<p>hello</p>").unwrap();
        let body = enc.finish().unwrap();
        assert_eq!(decode_body(&body).unwrap(), "<p>hello</p>");
    }

    #[test]
    fn corrupt_gzip_is_a_decode_error() {
        let err = decode_body(&[0x1f, 0x8b, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.kind(), "decode_error");
    }

    #[test]
    fn falls_back_to_latin1() {
        assert_eq!(decode_body(&[b'c', b'a', b'f', 0xe9]).unwrap(), "café");
    }

    #[test]
    fn empty_shell_reaches_regex_tier() {
        let tiered = extract_tiers(
            "<html><body><div id=\"root\"></div></body></html>",
            &url(),
            OutputShape::Text,
            200,
            20,
        );
        assert_eq!(tiered.method, ExtractionMethod::RegexStrip);
        assert!(tiered.plain.is_empty());
    }

    #[test]
    fn raw_shape_returns_document() {
        let doc = "<html><body><p>Short</p></body></html>";
        let tiered = extract_tiers(doc, &url(), OutputShape::Raw, 200, 20);
        assert_eq!(tiered.text, doc);
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        let converter = Arc::new(RecordingConverter::default());
        let request = ExtractionRequest::new("https://example.com/page");

        let result = fetcher(Ok(response(503, "text/html", b"")), converter.clone())
            .fetch(&request, &url(), None, Duration::from_secs(5))
            .await;
        assert_eq!(assert_err!(result), FetchError::Http5xx(503));

        let result = fetcher(Ok(response(404, "text/html", b"")), converter)
            .fetch(&request, &url(), None, Duration::from_secs(5))
            .await;
        assert_eq!(assert_err!(result), FetchError::Http4xx(404));
    }

    #[tokio::test]
    async fn delegates_documents_to_converter() {
        let converter = Arc::new(RecordingConverter::default());
        let request = ExtractionRequest::new("https://example.com/page").with_conversion(true);
        let page = fetcher(Ok(response(200, "application/pdf", b"%PDF-1.4")), converter.clone())
            .fetch(&request, &url(), None, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(page.method, ExtractionMethod::Converted);
        assert_eq!(page.conversion.unwrap().original_format, "pdf");
        assert_eq!(*converter.calls.lock().unwrap(), vec!["pdf".to_string()]);
    }

    #[tokio::test]
    async fn skips_converter_when_disabled() {
        let converter = Arc::new(RecordingConverter::default());
        let request = ExtractionRequest::new("https://example.com/page");
        let page = fetcher(Ok(response(200, "application/pdf", b"%PDF-1.4 text")), converter.clone())
            .fetch(&request, &url(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(page.method, ExtractionMethod::Converted);
        assert!(converter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_conversion_is_reported_with_its_kind() {
        let converter = Arc::new(RecordingConverter {
            fail: true,
            ..Default::default()
        });
        let request = ExtractionRequest::new("https://example.com/page").with_conversion(true);
        let result = fetcher(Ok(response(200, "application/pdf", b"%PDF-1.4 \x00\x01")), converter)
            .fetch(&request, &url(), None, Duration::from_secs(5))
            .await;

        let err = assert_err!(result);
        assert_eq!(err.kind(), "conversion_failed");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn oversized_document_never_reaches_the_converter() {
        let converter = Arc::new(RecordingConverter::default());
        let mut request = ExtractionRequest::new("https://example.com/report.pdf").with_conversion(true);
        request.max_file_size_mb = 1;
        let body = vec![b'x'; 2 * 1024 * 1024];
        let result = fetcher(Ok(response(200, "application/pdf", &body)), converter.clone())
            .fetch(&request, &url(), None, Duration::from_secs(5))
            .await;

        let err = assert_err!(result);
        assert_eq!(err.kind(), "size_exceeded");
        assert_eq!(err.status(), 413);
        assert!(converter.calls.lock().unwrap().is_empty());
    }
}
