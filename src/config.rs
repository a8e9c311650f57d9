use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ServerError;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_idle_timeout_secs() -> u64 {
    45
}

/// Listening and connection-lifecycle settings for one server instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to listen on.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Time to live for idle connections. Reclamation is approximate:
    /// it is triggered by registry activity, never by a dedicated timer.
    #[serde(default = "default_idle_timeout_secs")]
    pub connection_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connection_idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Loads settings from environment variables, falling back to defaults.
    /// Filled in variables are: HAWSER_HOST, HAWSER_PORT, HAWSER_IDLE_TIMEOUT_SECS
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HAWSER_HOST").unwrap_or(defaults.host),
            port: std::env::var("HAWSER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            connection_idle_timeout_secs: std::env::var("HAWSER_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connection_idle_timeout_secs),
        }
    }

    /// Idle timeout as a [`Duration`].
    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), ServerError> {
        if self.connection_idle_timeout_secs == 0 {
            return Err(ServerError::Config(
                "connection_idle_timeout_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
