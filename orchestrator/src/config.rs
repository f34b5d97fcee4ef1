use catalog::database::StateBackend;
use controller::analysis::RunnerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DATABASE_URL_ENV: &str = "ORCHESTRATOR_DATABASE_URL";
pub const POLL_INTERVAL_ENV: &str = "ORCHESTRATOR_POLL_INTERVAL_MS";
pub const POLL_TIMEOUT_ENV: &str = "ORCHESTRATOR_POLL_TIMEOUT_SECS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://state.db?mode=rwc`. In-memory when unset.
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        let defaults = RunnerConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            poll_timeout_secs: defaults.poll_timeout.as_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub database: DatabaseConfig,
    pub runner: RunnerSettings,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
    pub channel_capacity: usize,
    /// Resume analyses a previous process left queued or running.
    pub resume_on_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            runner: RunnerSettings::default(),
            log_filter: "info".to_string(),
            channel_capacity: 16,
            resume_on_start: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Applies `ORCHESTRATOR_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.database.url = Some(url);
        }
        if let Some(value) = lookup(POLL_INTERVAL_ENV) {
            self.runner.poll_interval_ms = parse_number(POLL_INTERVAL_ENV, &value)?;
        }
        if let Some(value) = lookup(POLL_TIMEOUT_ENV) {
            self.runner.poll_timeout_secs = parse_number(POLL_TIMEOUT_ENV, &value)?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.runner.poll_interval_ms == 0 {
            return Err(invalid("runner.poll_interval_ms", "0", "must be positive"));
        }
        if self.runner.poll_timeout_secs == 0 {
            return Err(invalid("runner.poll_timeout_secs", "0", "must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "0", "must be positive"));
        }
        Ok(self)
    }

    pub fn state_backend(&self) -> StateBackend {
        match &self.database.url {
            Some(url) => StateBackend::sqlite(url.clone()),
            None => StateBackend::Memory,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.runner.poll_interval_ms),
            poll_timeout: Duration::from_secs(self.runner.poll_timeout_secs),
        }
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(name, value, &e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let config = OrchestratorConfig::from_toml("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert!(matches!(config.state_backend(), StateBackend::Memory));
        assert_eq!(config.runner_config(), RunnerConfig::default());
    }

    #[test]
    fn toml_sections_are_read() {
        let config = OrchestratorConfig::from_toml(
            r#"
            log_filter = "debug,sea_orm=warn"
            resume_on_start = false

            [database]
            url = "sqlite://state.db?mode=rwc"

            [runner]
            poll_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.log_filter, "debug,sea_orm=warn");
        assert!(!config.resume_on_start);
        assert_eq!(config.database.url.as_deref(), Some("sqlite://state.db?mode=rwc"));
        assert_eq!(config.runner_config().poll_interval, Duration::from_millis(250));
        assert_eq!(config.runner.poll_timeout_secs, 3600);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            OrchestratorConfig::from_toml("[runner]\npoll_every = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_file() {
        let env = HashMap::from([
            (DATABASE_URL_ENV, "sqlite::memory:"),
            (POLL_INTERVAL_ENV, "50"),
            (POLL_TIMEOUT_ENV, " 10 "),
        ]);
        let config = OrchestratorConfig::default()
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(
            config.runner_config(),
            RunnerConfig {
                poll_interval: Duration::from_millis(50),
                poll_timeout: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = OrchestratorConfig::default()
            .with_overrides(|name| (name == POLL_INTERVAL_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name, .. } if name == POLL_INTERVAL_ENV));

        assert!(OrchestratorConfig::from_toml("channel_capacity = 0").is_err());
    }
}
