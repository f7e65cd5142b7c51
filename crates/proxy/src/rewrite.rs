//! The rewriting shim: one per configured source.
//!
//! Every sample coming back from the wrapped source has its labels replaced
//! by the merge of its original labels with the shim's static set, static
//! labels winning. Prometheus metric identity is the (name, label set)
//! tuple, so this is what disambiguates merged outputs without touching
//! metric names. Pairs serialize sorted by label name for byte-stable
//! output.

use std::collections::{BTreeMap, HashMap};

use reverse_exporter_config::EXPORTER_NAME_LABEL;
use reverse_exporter_expfmt::{LabelPair, MetricFamily};
use tokio_util::sync::CancellationToken;

use crate::error::ScrapeError;
use crate::source::{ScrapeValues, Source};

pub struct RewriteSource {
    name: String,
    labels: BTreeMap<String, String>,
    source: Source,
}

impl RewriteSource {
    /// Builds the shim for a source. Unless rewriting is disabled, the
    /// static set gains `exporter_name = <source name>`; the configuration
    /// layer has already rejected user attempts to set that label.
    pub fn new(
        name: &str,
        no_rewrite: bool,
        static_labels: &HashMap<String, String>,
        source: Source,
    ) -> Self {
        let mut labels: BTreeMap<String, String> = static_labels
            .iter()
            .map(|(label, value)| (label.clone(), value.clone()))
            .collect();
        if !no_rewrite {
            labels.insert(EXPORTER_NAME_LABEL.to_string(), name.to_string());
        }
        Self {
            name: name.to_string(),
            labels,
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scrapes the wrapped source under a derived scope and rewrites the
    /// returned samples.
    pub async fn scrape(
        &self,
        scope: &CancellationToken,
        values: &ScrapeValues,
    ) -> Result<Vec<MetricFamily>, ScrapeError> {
        let child_scope = scope.child_token();
        let mut families = self.source.scrape(&child_scope, values).await?;
        rewrite_families(&self.labels, &mut families);
        Ok(families)
    }
}

/// Applies the static label set to every sample of every family.
pub(crate) fn rewrite_families(
    static_labels: &BTreeMap<String, String>,
    families: &mut [MetricFamily],
) {
    for family in families {
        for metric in &mut family.metric {
            let mut merged: BTreeMap<String, String> = metric
                .label
                .drain(..)
                .filter_map(|pair| Some((pair.name?, pair.value.unwrap_or_default())))
                .collect();
            for (label, value) in static_labels {
                merged.insert(label.clone(), value.clone());
            }
            metric.label = merged
                .into_iter()
                .map(|(label, value)| LabelPair::new(label, value))
                .collect();
        }
    }
}
