use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use dotenv::dotenv;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use text_extractor::api;
use text_extractor::browser::chrome::ChromeBackend;
use text_extractor::browser::BrowserBackend;
use text_extractor::convert::CommandConverter;
use text_extractor::links::AnchorLinkExtractor;
use text_extractor::proxy::ProxyPool;
use text_extractor::static_fetch::ReqwestTransport;
use text_extractor::{ExtractorConfig, Orchestrator};

#[derive(OpenApi)]
#[openapi(
    paths(api::extract, api::health, api::list_proxies),
    components(
        schemas(
            api::ExtractBody,
            api::HealthResponse,
            text_extractor::model::ExtractionOutcome,
            text_extractor::model::ExtractionMode,
            text_extractor::model::OutputShape,
            text_extractor::model::ExtractionBias,
            text_extractor::model::ExtractionMethod,
            text_extractor::model::FetchPath,
            text_extractor::model::CandidateSummary,
            text_extractor::model::Origin,
            text_extractor::quality::QualityMetrics,
            text_extractor::links::LinkInfo,
            text_extractor::links::LinkType,
            text_extractor::proxy::ProxyInfo,
            text_extractor::proxy::ProxyStats
        )
    ),
    tags(
        (name = "extractor", description = "Text extraction"),
        (name = "proxy", description = "Proxy pool state")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("text_extractor=info,tower_http=info")),
        )
        .init();

    let config = ExtractorConfig::from_env();
    let pool = Arc::new(ProxyPool::new(&config.proxy));
    info!(proxies = pool.len(), "proxy pool ready");

    let browser: Arc<dyn BrowserBackend> = Arc::new(ChromeBackend::new(config.browser.clone()));
    if !browser.is_available() {
        tracing::warn!("no Chrome executable found, browser extraction will fail until one is installed");
    }

    let orchestrator = Orchestrator::new(
        config.clone(),
        pool,
        Arc::new(ReqwestTransport),
        Some(browser),
        Arc::new(CommandConverter::default()),
        Arc::new(AnchorLinkExtractor::new(config.max_links)),
    );
    let state = Arc::new(api::AppState {
        orchestrator: Arc::new(orchestrator),
    });

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/extract", post(api::extract))
        .route("/health", get(api::health))
        .route("/proxies", get(api::list_proxies))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
