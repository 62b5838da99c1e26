//! Client configuration.

use std::env;
use std::time::Duration;

use tessera_engine::sync::{DEFAULT_PING_INTERVAL_MS, DEFAULT_RECONNECT_DELAY_MS};
use tessera_engine::{CollectionId, SessionId, SyncOptions};
use url::Url;

/// Default upper bound between two driver wakeups.
pub const DEFAULT_TICK_MS: u64 = 250;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:3000/ws`
    pub url: String,
    /// Session every frame is scoped to
    pub session_id: SessionId,
    /// Bearer token sent on upgrade
    pub token: Option<String>,
    /// Delay before reconnecting after a close, in milliseconds
    pub reconnect_delay: u64,
    /// Keepalive interval, in milliseconds
    pub ping_interval: u64,
    /// Longest the driver sleeps without checking the engine
    pub tick: Duration,
    /// Collections the binary creates on start
    pub collections: Vec<CollectionId>,
}

impl ClientConfig {
    /// Config with defaults for everything but the endpoint and session.
    pub fn new(url: impl Into<String>, session_id: impl Into<SessionId>) -> Self {
        Self {
            url: url.into(),
            session_id: session_id.into(),
            token: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY_MS,
            ping_interval: DEFAULT_PING_INTERVAL_MS,
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            collections: Vec::new(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("TESSERA_URL").ok_or(ConfigError::Missing("TESSERA_URL"))?;
        let session_id = lookup("TESSERA_SESSION").ok_or(ConfigError::Missing("TESSERA_SESSION"))?;

        let mut config = Self::new(url, session_id);
        config.token = lookup("TESSERA_TOKEN").filter(|token| !token.is_empty());

        if let Some(value) = lookup("TESSERA_RECONNECT_MS") {
            config.reconnect_delay = millis("TESSERA_RECONNECT_MS", &value)?;
        }
        if let Some(value) = lookup("TESSERA_PING_MS") {
            config.ping_interval = millis("TESSERA_PING_MS", &value)?;
        }
        if let Some(value) = lookup("TESSERA_TICK_MS") {
            config.tick = Duration::from_millis(millis("TESSERA_TICK_MS", &value)?.max(1));
        }
        if let Some(value) = lookup("TESSERA_COLLECTIONS") {
            config.collections = value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(config)
    }

    /// Builder-style method to set the bearer token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Builder-style method to set the reconnect delay.
    pub fn reconnect_delay(mut self, millis: u64) -> Self {
        self.reconnect_delay = millis;
        self
    }

    /// Builder-style method to set the keepalive interval.
    pub fn ping_interval(mut self, millis: u64) -> Self {
        self.ping_interval = millis;
        self
    }

    /// Builder-style method to set the driver tick.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Session options for the engine.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions::new(self.session_id.clone())
            .reconnect_delay(self.reconnect_delay)
            .ping_interval(self.ping_interval)
    }

    /// Endpoint with the percent-encoded session query appended.
    pub fn endpoint(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&self.url).map_err(|_| ConfigError::Invalid {
            key: "TESSERA_URL",
            value: self.url.clone(),
        })?;
        url.query_pairs_mut().append_pair("session", &self.session_id);
        Ok(url.into())
    }
}

fn millis(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {key} value: {value}")]
    Invalid { key: &'static str, value: String },
}
