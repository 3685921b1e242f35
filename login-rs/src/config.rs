use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Text of the `* OK` greeting sent on connect.
    pub greeting: String,
    /// Include `[CAPABILITY ...]` in the greeting.
    pub greeting_capability: bool,
    /// Refuse LOGIN (and hide plaintext mechanisms) on unsecured connections.
    pub disable_plaintext_auth: bool,
    /// Maximum simultaneous pre-login connections.
    pub max_logging_users: usize,
    pub verbose_proctitle: bool,
    pub process_per_connection: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Address of the authentication service.
    pub service_addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1143".to_string(),
            greeting: "IMAP login service ready.".to_string(),
            greeting_capability: false,
            disable_plaintext_auth: true,
            max_logging_users: 256,
            verbose_proctitle: false,
            process_per_connection: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_addr: "127.0.0.1:12500".to_string(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::LoginError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| crate::error::LoginError::Config(e.to_string()))
    }
}
