use std::{env, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{FederationErr, Result};

const DEFAULT_DIRECTOR_HOST: &str = "localhost";
const DEFAULT_DIRECTOR_PORT: u16 = 50051;

/// How to reach the orchestration service and how to present ourselves to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub client_id: String,
    pub director_host: String,
    pub director_port: u16,
    pub tls: bool,
    pub cert_common_name: String,
    pub reconnect_interval_ms: u64,
    /// Reconnection attempts per call while the peer is unavailable, 0 for unlimited.
    pub max_reconnect_attempts: usize,
    pub federation_id: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            client_id: "frontend".to_string(),
            director_host: DEFAULT_DIRECTOR_HOST.to_string(),
            director_port: DEFAULT_DIRECTOR_PORT,
            tls: false,
            cert_common_name: String::new(),
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 0,
            federation_id: "federation".to_string(),
        }
    }
}

impl FederationConfig {
    /// Creates a new `FederationConfig` pointing at `director_host:director_port`.
    pub fn new(director_host: impl Into<String>, director_port: u16) -> Self {
        Self {
            director_host: director_host.into(),
            director_port,
            ..Default::default()
        }
    }

    /// Reads the config from `FL_DIRECTOR_HOST`, `FL_DIRECTOR_PORT`, `FL_CLIENT_ID`, `FL_TLS`
    /// and `FL_RECONNECT_INTERVAL_MS`, unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reading variables through `var`.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = var("FL_DIRECTOR_HOST") {
            config.director_host = host;
        }

        if let Some(port) = var("FL_DIRECTOR_PORT") {
            config.director_port = parse_var("FL_DIRECTOR_PORT", &port)?;
        }

        if let Some(client_id) = var("FL_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Some(tls) = var("FL_TLS") {
            let tls = tls.trim().to_ascii_lowercase();
            config.tls = matches!(tls.as_str(), "1" | "true" | "yes");
        }

        if let Some(interval) = var("FL_RECONNECT_INTERVAL_MS") {
            config.reconnect_interval_ms = parse_var("FL_RECONNECT_INTERVAL_MS", &interval)?;
        }

        Ok(config)
    }

    /// Reads the config from a JSON file, missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FederationErr::Config(format!("cannot read '{}': {e}", path.display()))
        })?;

        Ok(serde_json::from_str(&content)?)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_federation_id(mut self, federation_id: impl Into<String>) -> Self {
        self.federation_id = federation_id.into();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_cert_common_name(mut self, cert_common_name: impl Into<String>) -> Self {
        self.cert_common_name = cert_common_name.into();
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// The `host:port` address of the director.
    pub fn director_addr(&self) -> String {
        format!("{}:{}", self.director_host, self.director_port)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| FederationErr::Config(format!("invalid {key} '{raw}': {e}")))
}
