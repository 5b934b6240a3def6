//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default; values that are present but unusable are rejected. Credentials
//! embedded in the media engine URI are redacted in Debug output.

use crate::pairing::PairingStrategy;

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default WebSocket signaling bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default media engine WebSocket URI.
pub const DEFAULT_KMS_WS_URI: &str = "ws://localhost:8888/kurento";

/// Default room settle window in milliseconds.
pub const DEFAULT_ROOM_SETTLE_WINDOW_MS: u64 = 2000;

/// Default deadline for one establishment attempt in seconds.
pub const DEFAULT_ESTABLISHMENT_TIMEOUT_SECONDS: u64 = 30;

/// Default deadline for one media engine request in seconds.
pub const DEFAULT_ENGINE_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Signaling service configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Media engine WebSocket URI.
    pub kms_ws_uri: Url,

    /// How pairs are formed.
    pub pairing_strategy: PairingStrategy,

    /// Settle window before room auto-pairing.
    pub room_settle_window: Duration,

    /// Deadline for one establishment attempt.
    pub establishment_timeout: Duration,

    /// Deadline for one media engine request.
    pub engine_request_timeout: Duration,

    /// Whether chat messages are relayed between peers.
    pub chat_enabled: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("kms_ws_uri", &redacted_uri(&self.kms_ws_uri))
            .field("pairing_strategy", &self.pairing_strategy)
            .field("room_settle_window", &self.room_settle_window)
            .field("establishment_timeout", &self.establishment_timeout)
            .field("engine_request_timeout", &self.engine_request_timeout)
            .field("chat_enabled", &self.chat_enabled)
            .finish()
    }
}

/// Engine URI with any userinfo replaced, for logs and Debug output.
#[must_use]
pub fn redacted_uri(uri: &Url) -> String {
    if uri.username().is_empty() && uri.password().is_none() {
        return uri.to_string();
    }
    let mut stripped = uri.clone();
    let _ = stripped.set_username("");
    let _ = stripped.set_password(None);
    stripped.to_string().replacen("://", "://[REDACTED]@", 1)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SIGNALING_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let raw_uri = vars
            .get("KMS_WS_URI")
            .map(String::as_str)
            .unwrap_or(DEFAULT_KMS_WS_URI);
        let kms_ws_uri = Url::parse(raw_uri)
            .map_err(|e| ConfigError::InvalidValue(format!("KMS_WS_URI: {e}")))?;
        if !matches!(kms_ws_uri.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue(format!(
                "KMS_WS_URI: unsupported scheme '{}', expected ws or wss",
                kms_ws_uri.scheme()
            )));
        }

        let pairing_strategy = match vars.get("SIGNALING_PAIRING_STRATEGY") {
            Some(value) => value
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("SIGNALING_PAIRING_STRATEGY: {e}")))?,
            None => PairingStrategy::default(),
        };

        let room_settle_window = Duration::from_millis(positive(
            vars,
            "SIGNALING_ROOM_SETTLE_WINDOW_MS",
            DEFAULT_ROOM_SETTLE_WINDOW_MS,
        )?);

        let establishment_timeout = Duration::from_secs(positive(
            vars,
            "SIGNALING_ESTABLISHMENT_TIMEOUT_SECONDS",
            DEFAULT_ESTABLISHMENT_TIMEOUT_SECONDS,
        )?);

        let engine_request_timeout = Duration::from_secs(positive(
            vars,
            "SIGNALING_ENGINE_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_ENGINE_REQUEST_TIMEOUT_SECONDS,
        )?);

        let chat_enabled = match vars.get("SIGNALING_CHAT_ENABLED") {
            Some(value) => value.trim().parse::<bool>().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "SIGNALING_CHAT_ENABLED: expected true or false, got '{value}'"
                ))
            })?,
            None => true,
        };

        Ok(Config {
            bind_address,
            health_bind_address,
            kms_ws_uri,
            pairing_strategy,
            room_settle_window,
            establishment_timeout,
            engine_request_timeout,
            chat_enabled,
        })
    }
}

/// Parse a non-zero integer variable, falling back to `default` when absent.
fn positive(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue(format!("{key}: must be greater than zero"))),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::InvalidValue(format!("{key}: {e}"))),
    }
}
