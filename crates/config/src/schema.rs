//! The strict configuration schema.
//!
//! Base exporter fields (`name`, `no_rewrite`, `labels`) are declared inline
//! on each exporter kind so `deny_unknown_fields` keeps working; serde's
//! `flatten` would silently disable it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result, EXPORTER_NAME_LABEL};

/// Top level configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub web: Option<WebConfig>,

    /// Raw per-kind defaults, merged into each exporter entry before the
    /// strict decode. Kept here so the top-level key is recognized.
    #[serde(default)]
    pub exporter_defaults: Option<ExporterDefaults>,

    #[serde(default)]
    pub reverse_exporters: Vec<ReverseExporterConfig>,
}

/// Global settings for the webserver hosting the endpoints.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    /// Prefix path composed in front of every endpoint path.
    #[serde(default)]
    pub context_path: String,

    /// Listener URLs, e.g. `http://0.0.0.0:9998`.
    #[serde(default)]
    pub listen: Vec<String>,

    #[serde(default, with = "humantime_serde")]
    pub read_header_timeout: Option<Duration>,
}

/// Per-kind partial defaults. Values stay raw: they are merged into entries
/// which are themselves decoded strictly, so bogus default keys still fail.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExporterDefaults {
    #[serde(default)]
    pub http: Option<serde_yaml::Value>,
    #[serde(default)]
    pub file: Option<serde_yaml::Value>,
    #[serde(default)]
    pub exec: Option<serde_yaml::Value>,
    #[serde(default)]
    pub exec_cached: Option<serde_yaml::Value>,
}

/// Basic authentication credentials accepted on an endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuthConfig {
    pub username: String,
    /// Plain text password. Credentials with an empty password are ignored.
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub basic_auth: Vec<BasicAuthConfig>,
}

/// One logically-decoded endpoint: a path plus the exporters aggregated
/// underneath it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReverseExporterConfig {
    pub path: String,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    pub exporters: ExportersConfig,
}

/// The exporters configured under one endpoint, by kind.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExportersConfig {
    #[serde(default)]
    pub http: Vec<HttpExporterConfig>,
    #[serde(default)]
    pub file: Vec<FileExporterConfig>,
    #[serde(default)]
    pub exec: Vec<ExecExporterConfig>,
    #[serde(default)]
    pub exec_cached: Vec<CachedExecExporterConfig>,
}

impl ExportersConfig {
    /// Iterates the base fields of every exporter, in configuration order.
    pub fn base_fields(&self) -> impl Iterator<Item = (&str, &HashMap<String, String>)> {
        self.http
            .iter()
            .map(|e| (e.name.as_str(), &e.labels))
            .chain(self.file.iter().map(|e| (e.name.as_str(), &e.labels)))
            .chain(self.exec.iter().map(|e| (e.name.as_str(), &e.labels)))
            .chain(self.exec_cached.iter().map(|e| (e.name.as_str(), &e.labels)))
    }
}

/// A remote Prometheus exporter scraped over HTTP.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HttpExporterConfig {
    pub name: String,
    #[serde(default)]
    pub no_rewrite: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// URL the exporter is found at, e.g. `http://localhost:9100/metrics`.
    pub address: String,

    /// Upper bound for connecting and reading. Unset or zero inherits the
    /// inbound request deadline.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Forward the inbound request's URL parameters to this exporter.
    #[serde(default)]
    pub forward_url_params: bool,
}

/// A file of text-format metrics read from disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileExporterConfig {
    pub name: String,
    #[serde(default)]
    pub no_rewrite: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub path: PathBuf,
}

/// A script executed once per aggregated scrape batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecExporterConfig {
    pub name: String,
    #[serde(default)]
    pub no_rewrite: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A script executed on a fixed interval with the last result cached.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CachedExecExporterConfig {
    pub name: String,
    #[serde(default)]
    pub no_rewrite: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub exec_interval: Duration,
}

impl Config {
    /// Validates cross-field invariants that the schema alone cannot
    /// express. All violations terminate startup.
    pub fn validate(&self) -> Result<()> {
        let mut seen_paths = HashSet::new();
        for endpoint in &self.reverse_exporters {
            if endpoint.path.is_empty() {
                return Err(ConfigError::Invalid(
                    "reverse_exporters entries need a non-empty path".to_string(),
                ));
            }
            if !seen_paths.insert(endpoint.path.clone()) {
                return Err(ConfigError::DuplicatePath {
                    path: endpoint.path.clone(),
                });
            }
            endpoint.validate()?;
        }
        Ok(())
    }
}

impl ReverseExporterConfig {
    fn validate(&self) -> Result<()> {
        let mut seen_names = HashSet::new();
        for (name, labels) in self.exporters.base_fields() {
            if name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "exporter under endpoint {:?} needs a non-empty name",
                    self.path
                )));
            }
            if !seen_names.insert(name.to_string()) {
                return Err(ConfigError::DuplicateExporterName {
                    path: self.path.clone(),
                    name: name.to_string(),
                });
            }
            for (label, value) in labels {
                if label == EXPORTER_NAME_LABEL {
                    return Err(ConfigError::ReservedLabelOverride {
                        name: name.to_string(),
                        label: EXPORTER_NAME_LABEL.to_string(),
                    });
                }
                if label.is_empty() || value.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "exporter {name:?} has an empty label name or value"
                    )));
                }
            }
        }

        for exporter in &self.exporters.http {
            url::Url::parse(&exporter.address).map_err(|err| {
                ConfigError::Invalid(format!(
                    "exporter {:?} has an invalid address {:?}: {err}",
                    exporter.name, exporter.address
                ))
            })?;
        }
        for exporter in &self.exporters.exec_cached {
            if exporter.exec_interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "exporter {:?} needs a non-zero exec_interval",
                    exporter.name
                )));
            }
        }
        Ok(())
    }
}
