use std::{path::Path, time::Duration};

use bonded::{call::IceServer, error::Error};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<IceServer>,
    /// how long `ended` is shown before going back to `idle`
    pub ended_settle_ms: u64,
    /// upper bound for the subscription acknowledgment before the offer is published anyway
    pub subscribe_timeout_ms: u64,
    pub duration_tick_ms: u64,
    pub realtime: Option<RealtimeConfig>,
    pub rest: Option<RestConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ended_settle_ms: 1500,
            subscribe_timeout_ms: 10_000,
            duration_tick_ms: 1000,
            realtime: None,
            rest: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.duration_tick_ms == 0 {
            return Err(Error::InvalidConfig("duration_tick_ms must be non-zero".into()));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(Error::InvalidConfig("ice server without urls".into()));
        }
        if let Some(realtime) = &self.realtime {
            realtime.socket_url()?;
        }
        Ok(())
    }

    pub fn ended_settle(&self) -> Duration {
        Duration::from_millis(self.ended_settle_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms)
    }
}

/// Hosted realtime service (websocket broadcast channels)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// ex: wss://<project>.supabase.co/realtime/v1/websocket
    pub url: String,
    pub api_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    25_000
}

impl RealtimeConfig {
    pub fn socket_url(&self) -> Result<url::Url, Error> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| Error::InvalidConfig(format!("realtime url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "realtime url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// Hosted REST interface of the call_logs table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestConfig {
    /// ex: https://<project>.supabase.co
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_table() -> String {
    "call_logs".into()
}

impl RestConfig {
    pub fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.base_url.trim_end_matches('/'),
            self.table
        )
    }

    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}
