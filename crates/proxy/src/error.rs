//! Error types for the scrape engine.

use thiserror::Error;

/// Per-scrape errors. Each is isolated at the source boundary: a failing
/// source contributes nothing to the endpoint response and is never retried.
///
/// The type is `Clone` because the exec source multicasts one batch outcome
/// to every concurrent scraper.
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("file read failed: {0}")]
    FileScrape(String),

    #[error("HTTP scrape failed: {0}")]
    NetScrape(String),

    #[error("backend returned HTTP status {0}")]
    NetStatus(u16),

    #[error("error reading stdout pipe from metric script: {0}")]
    ExecPipe(String),

    #[error("error starting metric script: {0}")]
    ExecStart(String),

    #[error("metric script exited with error: {0}")]
    ExecWait(String),

    #[error("metric decoding failed: {0}")]
    Decode(String),

    #[error("scrape timed out before a result was available")]
    ScrapeTimeout,
}

/// Startup-only errors raised while assembling endpoints from configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid exporter address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
