//! Environment configuration and the YAML source registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bidscope_adapters::AdapterSettings;
use bidscope_core::{SourceTag, MAX_LOOKBACK_DAYS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_SYNC_CRON: &str = "0 0 * * *";
pub const DEFAULT_WEB_PORT: u16 = 8000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("source registry {path}: {message}")]
    Registry { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sam_api_key: Option<String>,
    pub sources_file: PathBuf,
    pub reports_dir: PathBuf,
    pub raw_archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            sam_api_key: var("SAM_API_KEY"),
            sources_file: var("BIDSCOPE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            reports_dir: var("BIDSCOPE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            raw_archive_dir: var("BIDSCOPE_RAW_ARCHIVE_DIR").map(PathBuf::from),
            scheduler_enabled: match var("BIDSCOPE_SCHEDULER_ENABLED") {
                Some(v) => parse_bool("BIDSCOPE_SCHEDULER_ENABLED", &v)?,
                None => false,
            },
            sync_cron: var("BIDSCOPE_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            user_agent: var("BIDSCOPE_USER_AGENT")
                .unwrap_or_else(|| format!("bidscope/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: match var("BIDSCOPE_HTTP_TIMEOUT_SECS") {
                Some(v) => parse_number("BIDSCOPE_HTTP_TIMEOUT_SECS", &v)?,
                None => DEFAULT_HTTP_TIMEOUT_SECS,
            },
            web_port: match var("BIDSCOPE_WEB_PORT") {
                Some(v) => parse_number("BIDSCOPE_WEB_PORT", &v)?,
                None => DEFAULT_WEB_PORT,
            },
        })
    }
}

/// Reports directory without requiring the rest of the configuration.
pub fn reports_dir_from_env() -> PathBuf {
    std::env::var("BIDSCOPE_REPORTS_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./reports"))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source: SourceTag,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub adapter: AdapterSettings,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceSettings {
    pub fn builtin(source: SourceTag) -> Self {
        let display_name = match source {
            SourceTag::Federal => "SAM.gov contract opportunities",
            SourceTag::Ny => "NYC City Record Online",
            SourceTag::Il => "Cook County contracts",
        };
        Self {
            source,
            enabled: true,
            display_name: Some(display_name.to_string()),
            adapter: AdapterSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSettings>,
}

impl SourceRegistry {
    /// Every known source, enabled, with upstream defaults.
    pub fn builtin() -> Self {
        Self {
            sources: SourceTag::ALL.into_iter().map(SourceSettings::builtin).collect(),
        }
    }

    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let registry: SourceRegistry = serde_yaml::from_str(text).map_err(|err| ConfigError::Registry {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let mut seen = HashSet::new();
        for settings in &registry.sources {
            if !seen.insert(settings.source) {
                return Err(ConfigError::Registry {
                    path: path.to_path_buf(),
                    message: format!("source `{}` is listed more than once", settings.source),
                });
            }
            if let Some(days) = settings.adapter.lookback_days {
                if !(0..=MAX_LOOKBACK_DAYS).contains(&days) {
                    return Err(ConfigError::Registry {
                        path: path.to_path_buf(),
                        message: format!(
                            "source `{}`: lookback_days {days} is outside 0..={MAX_LOOKBACK_DAYS}",
                            settings.source
                        ),
                    });
                }
            }
        }
        Ok(registry)
    }

    /// Load the registry file; a missing file means the built-in registry.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml_str(&text, path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no source registry file; using built-in sources");
                Ok(Self::builtin())
            }
            Err(err) => Err(ConfigError::Registry {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceSettings> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source: SourceTag) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.source == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn database_url_is_required() {
        let err = SyncConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

        let err = SyncConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_unset() {
        let config = SyncConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/bidscope")])).unwrap();
        assert_eq!(config.sources_file, PathBuf::from("sources.yaml"));
        assert_eq!(config.reports_dir, PathBuf::from("./reports"));
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.web_port, 8000);
        assert!(!config.scheduler_enabled);
        assert!(config.sam_api_key.is_none());
        assert!(config.user_agent.starts_with("bidscope/"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/bidscope"),
            ("BIDSCOPE_WEB_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "BIDSCOPE_WEB_PORT", .. }));

        let err = SyncConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/bidscope"),
            ("BIDSCOPE_SCHEDULER_ENABLED", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn registry_yaml_overrides_and_disables_sources() {
        let yaml = r#"
sources:
  - source: federal
    enabled: false
  - source: ny
    lookback_days: 30
    page_size: 200
  - source: il
    endpoint: http://localhost:9999/rows.json
"#;
        let registry = SourceRegistry::from_yaml_str(yaml, Path::new("sources.yaml")).unwrap();
        let enabled = registry.enabled().map(|s| s.source).collect::<Vec<_>>();
        assert_eq!(enabled, vec![SourceTag::Ny, SourceTag::Il]);

        let ny = registry.get(SourceTag::Ny).unwrap();
        assert_eq!(ny.adapter.lookback_days, Some(30));
        assert_eq!(ny.adapter.page_size, Some(200));
        assert_eq!(
            registry.get(SourceTag::Il).unwrap().adapter.endpoint.as_deref(),
            Some("http://localhost:9999/rows.json")
        );
    }

    #[test]
    fn duplicate_and_unknown_sources_are_registry_errors() {
        let dup = "sources:\n  - source: ny\n  - source: ny\n";
        assert!(SourceRegistry::from_yaml_str(dup, Path::new("s.yaml")).is_err());
        let unknown = "sources:\n  - source: tx\n";
        assert!(SourceRegistry::from_yaml_str(unknown, Path::new("s.yaml")).is_err());
    }

    #[test]
    fn out_of_range_lookback_is_a_registry_error() {
        for days in ["100000000", "-1"] {
            let yaml = format!("sources:\n  - source: ny\n    lookback_days: {days}\n");
            let err = SourceRegistry::from_yaml_str(&yaml, Path::new("sources.yaml")).unwrap_err();
            assert!(matches!(&err, ConfigError::Registry { message, .. } if message.contains("lookback_days")));
        }

        let yaml = format!("sources:\n  - source: ny\n    lookback_days: {MAX_LOOKBACK_DAYS}\n");
        assert!(SourceRegistry::from_yaml_str(&yaml, Path::new("sources.yaml")).is_ok());
    }

    #[tokio::test]
    async fn missing_registry_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(registry, SourceRegistry::builtin());
        assert_eq!(registry.enabled().count(), 3);
    }
}
