//! Connection settings for the hosted backend.

use std::{env, time::Duration};

use thiserror::Error;
use url::Url;

const DEFAULT_MEDIA_BUCKET: &str = "avatars";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;

/// Errors produced while parsing hosted backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Hosted backend endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedConfig {
    /// Project base URL, e.g. `https://abc.example.co/`.
    pub base_url: Url,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    /// Object storage bucket used for message images and avatars.
    pub media_bucket: String,
    pub http_timeout: Duration,
}

impl HostedConfig {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_base_url("CHAT_BACKEND_URL", base_url)?,
            anon_key: anon_key.into(),
            media_bucket: DEFAULT_MEDIA_BUCKET.to_owned(),
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
        })
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url = required("CHAT_BACKEND_URL", &mut lookup)?;
        let base_url = parse_base_url("CHAT_BACKEND_URL", &raw_url)?;
        let anon_key = required("CHAT_BACKEND_ANON_KEY", &mut lookup)?;
        let media_bucket = optional_trimmed("CHAT_MEDIA_BUCKET", &mut lookup)
            .unwrap_or_else(|| DEFAULT_MEDIA_BUCKET.to_owned());
        if media_bucket.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_MEDIA_BUCKET",
                value: media_bucket,
                reason: "bucket names cannot contain '/'".to_owned(),
            });
        }

        let http_timeout_ms = match optional_trimmed("CHAT_HTTP_TIMEOUT_MS", &mut lookup) {
            Some(value) => {
                let parsed = value
                    .parse::<u64>()
                    .map_err(|err| ConfigError::InvalidValue {
                        key: "CHAT_HTTP_TIMEOUT_MS",
                        value: value.clone(),
                        reason: err.to_string(),
                    })?;
                if parsed == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "CHAT_HTTP_TIMEOUT_MS",
                        value,
                        reason: "must be at least 1".to_owned(),
                    });
                }
                parsed
            }
            None => DEFAULT_HTTP_TIMEOUT_MS,
        };

        Ok(Self {
            base_url,
            anon_key,
            media_bucket,
            http_timeout: Duration::from_millis(http_timeout_ms),
        })
    }

    /// PostgREST endpoint for `table`.
    pub fn rest_url(&self, table: &str) -> Url {
        self.endpoint(&["rest", "v1", table])
    }

    /// Auth endpoint, e.g. `auth_url("token")`.
    pub fn auth_url(&self, path: &str) -> Url {
        self.endpoint(&["auth", "v1", path])
    }

    /// Upload endpoint for an object in `bucket`.
    pub fn object_url(&self, bucket: &str, name: &str) -> Url {
        self.endpoint(&["storage", "v1", "object", bucket, name])
    }

    /// Public download URL of an object in `bucket`.
    pub fn public_object_url(&self, bucket: &str, name: &str) -> Url {
        self.endpoint(&["storage", "v1", "object", "public", bucket, name])
    }

    /// Realtime websocket endpoint with the API key attached.
    pub fn realtime_url(&self) -> Url {
        let mut url = self.endpoint(&["realtime", "v1", "websocket"]);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always a valid scheme change for a base URL.
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

fn required<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed(key, lookup).ok_or(ConfigError::Missing { key })
}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_base_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidValue {
        key,
        value: raw.to_owned(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.to_owned(),
            reason: "expected an http(s) base URL".to_owned(),
        });
    }
    Ok(url)
}
