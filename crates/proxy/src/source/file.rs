//! File source: reads text-format metrics from disk, similar to the
//! node_exporter textfile collector.

use std::path::PathBuf;

use reverse_exporter_config::FileExporterConfig;
use reverse_exporter_expfmt::{self as expfmt, Format, MetricFamily};
use tokio_util::sync::CancellationToken;

use crate::error::ScrapeError;

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(config: &FileExporterConfig) -> Self {
        Self {
            path: config.path.clone(),
        }
    }

    /// Reads and decodes the file. The read await is raced against the
    /// scope so a stalled producer (e.g. a FIFO) cannot wedge the scrape.
    pub async fn scrape(
        &self,
        scope: &CancellationToken,
    ) -> Result<Vec<MetricFamily>, ScrapeError> {
        let contents = tokio::select! {
            read = tokio::fs::read(&self.path) => read.map_err(|err| {
                ScrapeError::FileScrape(format!("{}: {err}", self.path.display()))
            })?,
            _ = scope.cancelled() => {
                return Err(ScrapeError::FileScrape(format!(
                    "{}: read cancelled",
                    self.path.display()
                )));
            }
        };
        expfmt::decode(&contents, Format::Text)
            .map_err(|err| ScrapeError::FileScrape(err.to_string()))
    }
}
