//! The endpoint aggregator and router assembly.
//!
//! Each configured path owns an ordered list of rewriting shims. On an
//! inbound scrape the handler fans out one task per shim, joins the results
//! in completion order, and serializes the combined family sequence. A
//! failing source is logged and contributes nothing; it never fails the
//! endpoint.

use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::middleware;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use reverse_exporter_config::{Config, ReverseExporterConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::{basic_auth_middleware, BasicAuthValidator};
use crate::error::BuildError;
use crate::rewrite::RewriteSource;
use crate::serialize;
use crate::source::{
    CachedExecSource, ExecSource, FileSource, HttpSource, ScrapeValues, Source,
};
use crate::USER_AGENT;

/// One aggregated scrape endpoint: a path plus its rewriting shims, in
/// configuration order.
pub struct Endpoint {
    path: String,
    sources: Vec<Arc<RewriteSource>>,
}

impl Endpoint {
    /// Assembles the endpoint's sources. Expects configuration that already
    /// passed validation; only construction-time failures (e.g. address
    /// parsing) surface here.
    pub fn from_config(
        config: &ReverseExporterConfig,
        client: reqwest::Client,
    ) -> Result<Self, BuildError> {
        let mut sources = Vec::new();
        let exporters = &config.exporters;

        for exporter in &exporters.http {
            debug!(name = %exporter.name, "adding http exporter");
            sources.push(Arc::new(RewriteSource::new(
                &exporter.name,
                exporter.no_rewrite,
                &exporter.labels,
                Source::Http(HttpSource::new(exporter, client.clone())?),
            )));
        }
        for exporter in &exporters.file {
            debug!(name = %exporter.name, "adding file exporter");
            sources.push(Arc::new(RewriteSource::new(
                &exporter.name,
                exporter.no_rewrite,
                &exporter.labels,
                Source::File(FileSource::new(exporter)),
            )));
        }
        for exporter in &exporters.exec {
            debug!(name = %exporter.name, "adding exec exporter");
            sources.push(Arc::new(RewriteSource::new(
                &exporter.name,
                exporter.no_rewrite,
                &exporter.labels,
                Source::Exec(ExecSource::new(exporter)),
            )));
        }
        for exporter in &exporters.exec_cached {
            debug!(name = %exporter.name, "adding caching exec exporter");
            sources.push(Arc::new(RewriteSource::new(
                &exporter.name,
                exporter.no_rewrite,
                &exporter.labels,
                Source::ExecCached(CachedExecSource::new(exporter)),
            )));
        }

        Ok(Self {
            path: config.path.clone(),
            sources,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sources(&self) -> &[Arc<RewriteSource>] {
        &self.sources
    }
}

/// The GET handler implementing the aggregation algorithm.
pub async fn serve_metrics(
    State(endpoint): State<Arc<Endpoint>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let values: ScrapeValues = query
        .as_deref()
        .map(parse_query)
        .unwrap_or_default();

    // A child scope per request: dropping the guard (including an aborted
    // request) cancels every in-flight source scrape.
    let scope = CancellationToken::new();
    let _guard = scope.clone().drop_guard();

    debug!(path = %endpoint.path, backends = endpoint.sources.len(), "scraping exporters");
    let (results_tx, mut results) = mpsc::channel(endpoint.sources.len().max(1));
    for source in &endpoint.sources {
        let source = Arc::clone(source);
        let scope = scope.clone();
        let values = values.clone();
        let results_tx = results_tx.clone();
        tokio::spawn(async move {
            match source.scrape(&scope, &values).await {
                Ok(families) => {
                    let _ = results_tx.send(families).await;
                }
                Err(err) => {
                    error!(exporter = %source.name(), error = %err, "error scraping backend");
                }
            }
        });
    }
    drop(results_tx);

    // Join in arrival order until every scrape task has completed.
    let mut families = Vec::new();
    while let Some(scraped) = results.recv().await {
        families.extend(scraped);
    }

    serialize::metrics_response(&headers, &families)
}

/// Builds the router mounting one GET handler per configured endpoint,
/// composed with the web context path and wrapped in authentication when
/// configured.
pub fn build_router(config: &Config) -> Result<Router, BuildError> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| BuildError::HttpClient(err.to_string()))?;

    let context_path = config
        .web
        .as_ref()
        .map(|web| web.context_path.as_str())
        .unwrap_or("");

    let mut router = Router::new();
    for endpoint_config in &config.reverse_exporters {
        let path = join_path(context_path, &endpoint_config.path);
        let endpoint = Arc::new(Endpoint::from_config(endpoint_config, client.clone())?);
        info!(path = %path, exporters = endpoint.sources.len(), "mounting reverse exporter endpoint");

        let mut route = Router::new()
            .route(&path, get(serve_metrics))
            .with_state(endpoint);
        match endpoint_config
            .auth
            .as_ref()
            .and_then(|auth| BasicAuthValidator::from_config(auth))
        {
            Some(validator) => {
                info!(path = %path, "configuring basic authentication");
                route = route.layer(middleware::from_fn_with_state(
                    validator,
                    basic_auth_middleware,
                ));
            }
            None => debug!(path = %path, "authentication not configured"),
        }
        router = router.merge(route);
    }
    Ok(router)
}

fn parse_query(query: &str) -> ScrapeValues {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Joins the context path and endpoint path into one absolute route path.
fn join_path(context: &str, path: &str) -> String {
    let mut joined = String::from("/");
    for segment in context.split('/').chain(path.split('/')) {
        if segment.is_empty() {
            continue;
        }
        joined.push_str(segment);
        joined.push('/');
    }
    if joined.len() > 1 {
        joined.pop();
    }
    joined
}
