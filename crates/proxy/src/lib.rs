//! Per-endpoint scrape engine.
//!
//! One inbound HTTP scrape fans out into N parallel upstream scrapes, each
//! routed through a typed source adapter, label-rewritten, aggregated and
//! serialized under an optional authentication wrapper. Sources carry all
//! state; the endpoint handler itself is stateless between requests.

pub mod auth;
pub mod endpoint;
pub mod error;
pub mod rewrite;
pub mod serialize;
pub mod source;

pub use endpoint::{build_router, Endpoint};
pub use error::{BuildError, ScrapeError};
pub use rewrite::RewriteSource;
pub use source::{CachedExecSource, ExecSource, FileSource, HttpSource, ScrapeValues, Source};

/// User-Agent presented to upstream exporters.
pub const USER_AGENT: &str = concat!("Prometheus Reverse Exporter/", env!("CARGO_PKG_VERSION"));

/// Accept header offered on upstream scrapes: protobuf preferred, text
/// accepted.
pub(crate) const SCRAPE_ACCEPT: &str =
    "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;\
     encoding=delimited;q=0.7,text/plain;version=0.0.4;q=0.3,*/*;q=0.1";
