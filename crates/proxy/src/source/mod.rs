//! Typed source adapters.
//!
//! The set of source kinds is closed and known at compile time, so the
//! adapters form a sum type rather than trait objects. Every kind exposes a
//! single capability: given a cancellation scope and the inbound query
//! values, produce metric families or a [`ScrapeError`].

mod exec;
mod exec_cached;
mod file;
mod net;

pub use exec::ExecSource;
pub use exec_cached::CachedExecSource;
pub use file::FileSource;
pub use net::HttpSource;

use reverse_exporter_expfmt::MetricFamily;
use tokio_util::sync::CancellationToken;

use crate::error::ScrapeError;

/// URL query values forwarded from the inbound scrape request.
pub type ScrapeValues = Vec<(String, String)>;

/// A configured upstream producing metric families on demand.
pub enum Source {
    File(FileSource),
    Http(HttpSource),
    Exec(ExecSource),
    ExecCached(CachedExecSource),
}

impl Source {
    /// Scrapes the upstream. Cancelling `scope` aborts the scrape; the
    /// blocking source kinds report that as [`ScrapeError::ScrapeTimeout`].
    pub async fn scrape(
        &self,
        scope: &CancellationToken,
        values: &ScrapeValues,
    ) -> Result<Vec<MetricFamily>, ScrapeError> {
        match self {
            Source::File(source) => source.scrape(scope).await,
            Source::Http(source) => source.scrape(scope, values).await,
            Source::Exec(source) => source.scrape(scope).await,
            Source::ExecCached(source) => source.scrape(scope).await,
        }
    }
}
