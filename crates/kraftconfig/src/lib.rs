use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What the engine does with a non-fatal error after logging it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Return the error to the caller. Meant for development and test builds.
    #[default]
    Propagate,
    /// Log and carry on with the next frame.
    Swallow,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KraftConfig {
    pub version: u32,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub errors: ErrorSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

impl Default for KraftConfig {
    fn default() -> Self {
        Self {
            version: 1,
            logging: LoggingSettings::default(),
            errors: ErrorSettings::default(),
            context: ContextSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            with_target: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ErrorSettings {
    #[serde(default)]
    pub mode: ErrorMode,
}

/// Settings for the dedicated GPU worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextSettings {
    #[serde(default = "default_context_label")]
    pub label: String,
    /// Capacity of the job channel feeding the worker; 0 means unbounded.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            label: default_context_label(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSettings {
    #[serde(default = "default_pipeline_label")]
    pub label: String,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub frame_budget: Option<Duration>,
    #[serde(default)]
    pub error_mode: Option<ErrorMode>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            label: default_pipeline_label(),
            frame_budget: None,
            error_mode: None,
        }
    }
}

impl PipelineSettings {
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_context_label() -> String {
    "kraft-gpu".to_string()
}

fn default_pipeline_label() -> String {
    "main".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(2)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or(default_shutdown_timeout()))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl KraftConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: KraftConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Error mode for the pipeline, preferring the per-pipeline override.
    pub fn error_mode(&self) -> ErrorMode {
        self.pipeline.error_mode.unwrap_or(self.errors.mode)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "logging.filter may not be empty".into(),
            ));
        }

        if let Err(err) = tracing_subscriber::EnvFilter::try_new(&self.logging.filter) {
            return Err(ConfigError::Invalid(format!(
                "logging.filter {:?} is not a valid filter: {err}",
                self.logging.filter
            )));
        }

        if self.context.label.trim().is_empty() {
            return Err(ConfigError::Invalid("context.label may not be empty".into()));
        }

        if self.context.shutdown_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "context.shutdown_timeout must be greater than zero".into(),
            ));
        }

        if self.pipeline.label.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "pipeline.label may not be empty".into(),
            ));
        }

        if let Some(budget) = self.pipeline.frame_budget {
            if budget.is_zero() {
                return Err(ConfigError::Invalid(
                    "pipeline.frame_budget must be greater than zero".into(),
                ));
            }
        }

        Ok(())
    }
}
