//! Net source: scrapes a remote Prometheus exporter over HTTP.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use reverse_exporter_config::HttpExporterConfig;
use reverse_exporter_expfmt::{self as expfmt, MetricFamily};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{BuildError, ScrapeError};
use crate::source::ScrapeValues;
use crate::SCRAPE_ACCEPT;

pub struct HttpSource {
    address: Url,
    deadline: Option<Duration>,
    forward_query_params: bool,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &HttpExporterConfig, client: reqwest::Client) -> Result<Self, BuildError> {
        let address = Url::parse(&config.address).map_err(|err| BuildError::InvalidAddress {
            address: config.address.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            address,
            deadline: config.timeout.filter(|timeout| !timeout.is_zero()),
            forward_query_params: config.forward_url_params,
            client,
        })
    }

    /// Issues the upstream GET. The outgoing query is always replaced: the
    /// forwarded inbound values when forwarding is enabled, nothing
    /// otherwise. A configured deadline bounds the request inside the
    /// inherited scope.
    pub async fn scrape(
        &self,
        scope: &CancellationToken,
        values: &ScrapeValues,
    ) -> Result<Vec<MetricFamily>, ScrapeError> {
        let mut url = self.address.clone();
        url.set_query(None);
        if self.forward_query_params && !values.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in values {
                pairs.append_pair(name, value);
            }
        }

        let request = self.client.get(url).header(ACCEPT, SCRAPE_ACCEPT);
        let fetch = async {
            let response = request
                .send()
                .await
                .map_err(|err| ScrapeError::NetScrape(err.to_string()))?;
            if response.status() != StatusCode::OK {
                return Err(ScrapeError::NetStatus(response.status().as_u16()));
            }
            let format = expfmt::response_format(
                response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok()),
            );
            let body = response
                .bytes()
                .await
                .map_err(|err| ScrapeError::NetScrape(err.to_string()))?;
            expfmt::decode(&body, format).map_err(|err| ScrapeError::Decode(err.to_string()))
        };

        tokio::select! {
            result = async {
                match self.deadline {
                    Some(deadline) => match tokio::time::timeout(deadline, fetch).await {
                        Ok(result) => result,
                        Err(_) => Err(ScrapeError::NetScrape(format!(
                            "no response within {deadline:?}"
                        ))),
                    },
                    None => fetch.await,
                }
            } => result,
            _ = scope.cancelled() => Err(ScrapeError::NetScrape("scrape cancelled".to_string())),
        }
    }
}
