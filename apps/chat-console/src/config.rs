//! Environment-backed runtime configuration for `chat-console`.

use std::{
    env,
    error::Error,
    fmt,
    path::PathBuf,
    time::Duration,
};

use chat_core::EngineConfig;

use crate::attachment::AttachmentLimits;

const DEFAULT_DATA_DIR: &str = "./.chat-console-store";
const CREDENTIALS_FILENAME: &str = "credentials.json";
const DEFAULT_ATTACHMENT_MAX_DIMENSION: u32 = 350;
const DEFAULT_ATTACHMENT_MAX_BYTES: usize = 1024 * 1024;

/// Runtime configuration used by the console app.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Optional email prefill for `/login`.
    pub prefill_email: Option<String>,
    /// Optional password prefill for `/login`.
    pub prefill_password: Option<String>,
    pub data_dir: PathBuf,
    /// Longest edge of an outgoing image after downscaling.
    pub attachment_max_dimension: u32,
    /// Encoded size cap for outgoing images.
    pub attachment_max_bytes: usize,
    pub merge_tolerance_ms: Option<u64>,
}

impl ConsoleConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let prefill_email = optional_trimmed_env("CHAT_EMAIL", &mut lookup);
        let prefill_password = optional_trimmed_env("CHAT_PASSWORD", &mut lookup);
        let data_dir = optional_trimmed_env("CHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let attachment_max_dimension = parse_optional_u32(
            "CHAT_ATTACHMENT_MAX_DIMENSION",
            &mut lookup,
        )?
        .unwrap_or(DEFAULT_ATTACHMENT_MAX_DIMENSION);
        let attachment_max_bytes = parse_optional_u64("CHAT_ATTACHMENT_MAX_BYTES", &mut lookup)?
            .map(|value| usize::try_from(value).unwrap_or(usize::MAX))
            .unwrap_or(DEFAULT_ATTACHMENT_MAX_BYTES);
        let merge_tolerance_ms = parse_optional_u64("CHAT_MERGE_TOLERANCE_MS", &mut lookup)?;

        if attachment_max_dimension == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_ATTACHMENT_MAX_DIMENSION",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if attachment_max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_ATTACHMENT_MAX_BYTES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            prefill_email,
            prefill_password,
            data_dir,
            attachment_max_dimension,
            attachment_max_bytes,
            merge_tolerance_ms,
        })
    }

    /// File backing the session credential store when the OS keyring is
    /// not compiled in.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILENAME)
    }

    pub fn attachment_limits(&self) -> AttachmentLimits {
        AttachmentLimits {
            max_dimension: self.attachment_max_dimension,
            max_bytes: self.attachment_max_bytes,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(ms) = self.merge_tolerance_ms {
            config.merge_tolerance = Duration::from_millis(ms);
        }
        config
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}
