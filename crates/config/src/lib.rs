//! Configuration for the reverse exporter.
//!
//! Loading is two-pass: the YAML document is first parsed into a raw value
//! so `exporter_defaults` can be merged into each exporter entry (map-deep,
//! list-replace, the entry winning on conflict), then the merged value is
//! deserialized into the strict schema. Unknown keys anywhere in the final
//! pass fail the load.

pub mod schema;

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;

pub use schema::{
    AuthConfig, BasicAuthConfig, CachedExecExporterConfig, Config, ExecExporterConfig,
    ExporterDefaults, ExportersConfig, FileExporterConfig, HttpExporterConfig,
    ReverseExporterConfig, WebConfig,
};

/// The reserved label carrying the configured exporter name. User-supplied
/// static labels may never set it.
pub const EXPORTER_NAME_LABEL: &str = "exporter_name";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate endpoint path {path:?}")]
    DuplicatePath { path: String },

    #[error("exporter name {name:?} used twice under endpoint {path:?}")]
    DuplicateExporterName { path: String, name: String },

    #[error("exporter {name:?} overrides the reserved {label:?} label")]
    ReservedLabelOverride { name: String, label: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Loads, merges and validates a configuration file.
pub fn load_from_file(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&raw)
}

/// Loads, merges and validates a configuration document.
pub fn load_from_str(raw: &str) -> Result<Config> {
    let mut doc: Value = serde_yaml::from_str(raw)?;
    apply_exporter_defaults(&mut doc);
    let config: Config = serde_yaml::from_value(doc)?;
    config.validate()?;
    Ok(config)
}

const EXPORTER_KINDS: [&str; 4] = ["http", "file", "exec", "exec_cached"];

/// Merges `exporter_defaults.<kind>` underneath every exporter entry of that
/// kind. Strictness is preserved: merged keys land in entries that are then
/// decoded with `deny_unknown_fields`.
fn apply_exporter_defaults(doc: &mut Value) {
    let Some(defaults) = doc.get("exporter_defaults").cloned() else {
        return;
    };
    let Some(endpoints) = doc
        .get_mut("reverse_exporters")
        .and_then(Value::as_sequence_mut)
    else {
        return;
    };

    for endpoint in endpoints {
        for kind in EXPORTER_KINDS {
            let Some(default) = defaults.get(kind) else {
                continue;
            };
            let Some(entries) = endpoint
                .get_mut("exporters")
                .and_then(|exporters| exporters.get_mut(kind))
                .and_then(Value::as_sequence_mut)
            else {
                continue;
            };
            for entry in entries {
                let merged = merge_values(default.clone(), std::mem::take(entry));
                *entry = merged;
            }
        }
    }
}

/// Deep merge with the overlay winning: mappings merge key-wise, everything
/// else (scalars, sequences) is replaced wholesale.
fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}
