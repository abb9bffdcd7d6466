//! Configuration loading (§4.6, §3's `ConfigDocument`): the collaborator the
//! master calls to obtain declared worker counts, re-invocable to support
//! `HUP`-triggered reloads.
//!
//! Grounded on the `config` crate carried by the teacher workspace (used
//! there by the sibling `airssys-wasm-cli` crate); `config` parses YAML,
//! TOML, and JSON documents itself, so no direct `toml`/`serde_json`
//! dependency is needed here. Enriched with the flat/environment-table
//! duality described in the original resque-pool README.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// Layer 2: Third-party crate imports
use config::{Config, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

// Layer 3: Internal module imports
use crate::queue_group::QueueGroup;

/// Errors raised while resolving or parsing a configuration file. Kept
/// distinct from `ForemanError` (§7 expansion) so a bad config file is never
/// confused with a runtime supervision failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found at '{path}'")]
    NotFound { path: String },

    #[error("failed to parse configuration file '{path}': {reason}")]
    ParseFailed { path: String, reason: String },

    #[error("queue-group entry '{queue_group}' has a non-integer, non-table value")]
    InvalidEntry { queue_group: String },
}

impl ConfigError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn parse_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_entry(queue_group: impl Into<String>) -> Self {
        Self::InvalidEntry {
            queue_group: queue_group.into(),
        }
    }
}

/// The resolved `QueueGroup -> target count` mapping the master reconciles
/// against (§3).
pub type Configuration = HashMap<QueueGroup, u32>;

/// A single raw value under a `ConfigDocument` top-level or environment-table
/// key: either a bare count or nothing (never nested further than §3
/// describes).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum RawEntry {
    Count(u32),
    EnvironmentTable(HashMap<String, u32>),
}

/// The parsed on-disk shape (§3 expansion): a flat map of QueueGroup string
/// to either a bare count or an environment-keyed table of counts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigDocument {
    #[serde(flatten)]
    entries: HashMap<String, RawEntry>,
}

impl ConfigDocument {
    /// Resolve this document into a `Configuration` for `environment`
    /// (absent selects only bare top-level entries). Environment-table
    /// entries override a bare entry with the same QueueGroup key (§3).
    pub fn resolve(&self, environment: Option<&str>) -> Configuration {
        let mut resolved = Configuration::new();

        for (key, value) in &self.entries {
            match value {
                RawEntry::Count(count) => {
                    resolved.insert(QueueGroup::new(key.clone()), *count);
                }
                RawEntry::EnvironmentTable(table) => {
                    if let Some(env) = environment {
                        if key == env {
                            for (qg, count) in table {
                                resolved.insert(QueueGroup::new(qg.clone()), *count);
                            }
                        }
                    }
                }
            }
        }

        resolved
    }
}

/// Derives the environment name the configuration loader resolves against,
/// in the priority order §4.6 specifies: `RACK_ENV`, then `RAILS_ENV`, then
/// `RESQUE_ENV`.
pub fn environment_from_env() -> Option<String> {
    std::env::var("RACK_ENV")
        .or_else(|_| std::env::var("RAILS_ENV"))
        .or_else(|_| std::env::var("RESQUE_ENV"))
        .ok()
}

/// Re-invocable collaborator producing a `Configuration` for a named
/// environment (§4.6). Implementations must support a reset hook invoked
/// before every reload so cached file contents never survive a `HUP`.
pub trait ConfigLoader {
    fn load(&mut self, environment: Option<&str>) -> Result<Configuration, ConfigError>;

    /// Invalidate any cached state. A no-op for loaders with nothing to
    /// cache; `FileConfigLoader` uses this to force re-reading its file.
    fn reset(&mut self) {}
}

/// The default collaborator: reads `path` through the `config` crate
/// (YAML/TOML/JSON by extension), parses it into a `ConfigDocument`, and
/// resolves it against the requested environment (§4.6 expansion).
pub struct FileConfigLoader {
    path: PathBuf,
    cached: Option<ConfigDocument>,
}

impl FileConfigLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: None,
        }
    }

    /// Default path when the CLI is given no `--config`/`FOREMAN_CONFIG`
    /// override (§4.6, §6 expansion).
    pub fn default_path() -> PathBuf {
        PathBuf::from("./foreman.yml")
    }

    fn read_document(&self) -> Result<ConfigDocument, ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::not_found(self.path.display().to_string()));
        }

        let config = Config::builder()
            .add_source(File::from(self.path.as_path()))
            .build()
            .map_err(|e| ConfigError::parse_failed(self.path.display().to_string(), e.to_string()))?;

        config
            .try_deserialize::<ConfigDocument>()
            .map_err(|e| ConfigError::parse_failed(self.path.display().to_string(), e.to_string()))
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&mut self, environment: Option<&str>) -> Result<Configuration, ConfigError> {
        self.reset();

        match self.read_document() {
            Ok(document) => {
                let resolved = document.resolve(environment);
                self.cached = Some(document);
                Ok(resolved)
            }
            Err(e) => Err(e),
        }
    }

    fn reset(&mut self) {
        self.cached = None;
    }
}

/// Reload helper for the master's `HUP` handling (§4.6): on a missing or
/// unparseable file, logs and keeps `previous` rather than collapsing the
/// pool to zero; only the very first load (at startup, via `load` directly)
/// is fatal.
pub fn reload_or_keep(
    loader: &mut dyn ConfigLoader,
    environment: Option<&str>,
    previous: &Configuration,
) -> Configuration {
    match loader.load(environment) {
        Ok(configuration) => configuration,
        Err(e) => {
            warn!(error = %e, "configuration reload failed, keeping previous configuration");
            previous.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code: unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn document_from_yaml(yaml: &str) -> ConfigDocument {
        serde_yaml_compatible(yaml)
    }

    // `config` crate's File source needs a real path, so unit tests that
    // only exercise `ConfigDocument::resolve` parse through `config` against
    // a temp file rather than hand-rolling a YAML deserializer here.
    fn serde_yaml_compatible(yaml: &str) -> ConfigDocument {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let config = Config::builder()
            .add_source(File::from(file.path()))
            .build()
            .unwrap();
        config.try_deserialize().unwrap()
    }

    #[test]
    fn bare_entry_is_visible_regardless_of_environment() {
        let doc = document_from_yaml("\"critical,high\": 4\n");
        assert_eq!(doc.resolve(None).get(&QueueGroup::new("critical,high")), Some(&4));
        assert_eq!(
            doc.resolve(Some("production")).get(&QueueGroup::new("critical,high")),
            Some(&4)
        );
    }

    #[test]
    fn environment_table_overrides_bare_entry_when_selected() {
        let doc = document_from_yaml(
            "\"critical,high\": 4\nproduction:\n  \"critical,high\": 8\n",
        );
        assert_eq!(
            doc.resolve(Some("production")).get(&QueueGroup::new("critical,high")),
            Some(&8)
        );
        assert_eq!(doc.resolve(None).get(&QueueGroup::new("critical,high")), Some(&4));
        assert_eq!(
            doc.resolve(Some("development")).get(&QueueGroup::new("critical,high")),
            None
        );
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let mut loader = FileConfigLoader::new("/nonexistent/path/foreman.yml");
        let err = loader.load(None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn reset_hook_forces_a_fresh_read_on_each_load() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(b"\"a,b\": 2\n").unwrap();
        let mut loader = FileConfigLoader::new(file.path());

        let first = loader.load(None).unwrap();
        assert_eq!(first.get(&QueueGroup::new("a,b")), Some(&2));

        file.as_file().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().seek(std::io::SeekFrom::Start(0)).unwrap();
        file.write_all(b"\"a,b\": 5\n").unwrap();
        file.as_file().sync_all().unwrap();

        let second = loader.load(None).unwrap();
        assert_eq!(second.get(&QueueGroup::new("a,b")), Some(&5));
    }
}
