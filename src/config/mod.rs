//! Layered configuration: programmatic defaults, overridden by an optional YAML
//! file, overridden by `CCORE_`-prefixed environment variables. Modeled on the
//! teacher's `config::mod.rs` Default-impl-plus-named-constructor style, but
//! loaded through the `config` crate's layering instead of a single JSON blob.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One configured project: a name, an absolute directory, and an optional note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    #[serde(with = "humantime_secs")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_secs")]
    pub reap_interval: Duration,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            idle_timeout: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub executable: PathBuf,
    #[serde(default)]
    pub default_args: Vec<String>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
    #[serde(default = "default_output_buffer_cap")]
    pub output_buffer_cap: usize,
    #[serde(with = "humantime_secs", default = "default_grace_window")]
    pub grace_window: Duration,
    #[serde(with = "humantime_secs", default = "default_idle_quiet_window")]
    pub idle_quiet_window: Duration,
    #[serde(with = "humantime_secs", default = "default_startup_probe")]
    pub startup_probe: Duration,
}

fn default_output_format() -> String {
    "text".to_string()
}
fn default_max_input_len() -> usize {
    32_768
}
fn default_output_buffer_cap() -> usize {
    256
}
fn default_grace_window() -> Duration {
    Duration::from_secs(10)
}
fn default_idle_quiet_window() -> Duration {
    Duration::from_millis(200)
}
fn default_startup_probe() -> Duration {
    Duration::from_secs(2)
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("assistant"),
            default_args: Vec::new(),
            output_format: default_output_format(),
            max_input_len: default_max_input_len(),
            output_buffer_cap: default_output_buffer_cap(),
            grace_window: default_grace_window(),
            idle_quiet_window: default_idle_quiet_window(),
            startup_probe: default_startup_probe(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(with = "humantime_millis", default = "default_debounce")]
    pub debounce: Duration,
    #[serde(with = "humantime_secs", default = "default_task_timeout")]
    pub task_timeout: Duration,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_history_cap() -> usize {
    100
}
fn default_debounce() -> Duration {
    Duration::from_millis(500)
}
fn default_task_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            debounce: default_debounce(),
            task_timeout: default_task_timeout(),
            max_retries: 0,
        }
    }
}

/// The fully validated, immutable configuration consumed by the five core
/// components at construction time. Loaded once at startup (see `load`); never
/// mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub data_dir: PathBuf,
}

impl CoreConfig {
    /// Load config by layering programmatic defaults, an optional YAML file at
    /// `path` (skipped silently if it does not exist), and environment
    /// variables prefixed `CCORE_` with `__` as the nested-key separator, e.g.
    /// `CCORE_SESSIONS__MAX_SESSIONS=4`. Validates the result before returning.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&CoreConfig::default_with_data_dir())
                .map_err(|e| ConfigError::Load(e.to_string()))?);

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CCORE")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        let cfg: CoreConfig = raw
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn default_with_data_dir() -> Self {
        let mut cfg = CoreConfig::default();
        cfg.data_dir = PathBuf::from("./data");
        cfg
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.max_sessions < 1 {
            return Err(ConfigError::Invalid {
                key: "sessions.max_sessions".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }
        for (name, project) in &self.projects {
            if !project.path.is_absolute() {
                return Err(ConfigError::Invalid {
                    key: format!("projects.{name}.path"),
                    reason: "must be an absolute path".to_string(),
                });
            }
            if !project.path.exists() {
                return Err(ConfigError::MissingProjectDir(
                    project.path.display().to_string(),
                ));
            }
        }
        Ok(())
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoreConfig::default_with_data_dir();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.sessions.max_sessions, 10);
        assert_eq!(cfg.assistant.output_format, "text");
    }

    #[test]
    fn rejects_zero_max_sessions() {
        let mut cfg = CoreConfig::default_with_data_dir();
        cfg.sessions.max_sessions = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_missing_project_dir() {
        let mut cfg = CoreConfig::default_with_data_dir();
        cfg.projects.insert(
            "ghost".to_string(),
            ProjectConfig {
                path: PathBuf::from("/nonexistent/definitely/not/here"),
                description: None,
            },
        );
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingProjectDir(_))
        ));
    }

    #[test]
    fn rejects_relative_project_dir() {
        let mut cfg = CoreConfig::default_with_data_dir();
        cfg.projects.insert(
            "rel".to_string(),
            ProjectConfig {
                path: PathBuf::from("relative/path"),
                description: None,
            },
        );
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }
}
