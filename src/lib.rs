//! Text extraction engine: fetches a URL over plain HTTP or a headless
//! browser, picks the best text it can get and reports how it got it.

pub mod api;
pub mod browser;
pub mod config;
pub mod convert;
pub mod detector;
pub mod error;
pub mod html;
pub mod links;
pub mod model;
pub mod orchestrator;
pub mod proxy;
pub mod quality;
pub mod retry;
pub mod spa;
pub mod static_fetch;

pub use config::ExtractorConfig;
pub use error::{ConversionError, FetchError, TeardownError};
pub use model::{ExtractionBias, ExtractionMode, ExtractionOutcome, ExtractionRequest, Origin, OutputShape};
pub use orchestrator::Orchestrator;
