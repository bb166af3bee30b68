//! Configuration for the voice client
//!
//! Every field has a default, so a TOML file only needs the values it changes.

use crate::audio::capture::CaptureConfig;
use crate::messages::SessionConfig;
use crate::transport::{endpoint_url, AuthParams};
use crate::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_URL: &str = "wss://api.catalyst.example.com/ws/voice";
pub const DEFAULT_TENANT_ID: &str = "catalyst-widget";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Base WebSocket endpoint; the realtime query is appended on connect
    pub url: String,

    /// Passed as `api_key` when set
    pub api_key: Option<String>,

    pub tenant_id: String,

    /// Sent with `session.create`
    pub session: SessionConfig,

    /// Microphone constraints; `capture.sample_rate` is also the session rate
    pub capture: CaptureConfig,

    /// Level monitor period
    pub level_interval_ms: u64,

    /// Bound on the wait for the transport to open
    pub connect_timeout_ms: u64,

    /// Capacity of the event channel handed to the UI
    pub event_capacity: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: None,
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            session: SessionConfig::default(),
            capture: CaptureConfig::default(),
            level_interval_ms: 50,
            connect_timeout_ms: 10_000,
            event_capacity: 100,
        }
    }
}

impl VoiceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| VoiceError::ConfigError(format!("Invalid config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| VoiceError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.session.namespace = namespace.into();
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.capture.sample_rate = sample_rate;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.capture.block_size = block_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_level_interval(mut self, interval: Duration) -> Self {
        self.level_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.capture.sample_rate
    }

    pub fn auth(&self) -> AuthParams {
        AuthParams {
            api_key: self.api_key.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn level_interval(&self) -> Duration {
        Duration::from_millis(self.level_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        endpoint_url(&self.url, &self.auth(), self.sample_rate())?;

        if self.tenant_id.trim().is_empty() {
            return Err(VoiceError::ConfigError("tenant_id must not be empty".into()));
        }
        if self.session.namespace.trim().is_empty() {
            return Err(VoiceError::ConfigError("session.namespace must not be empty".into()));
        }
        if self.capture.sample_rate == 0 {
            return Err(VoiceError::ConfigError("Sample rate must be greater than 0".into()));
        }
        if self.capture.channels != 1 {
            return Err(VoiceError::ConfigError(format!(
                "Only mono capture is supported, got {} channels",
                self.capture.channels
            )));
        }
        if self.capture.block_size == 0 {
            return Err(VoiceError::ConfigError("Capture block size must be greater than 0".into()));
        }
        if self.level_interval_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(VoiceError::ConfigError("Intervals must be greater than 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(VoiceError::ConfigError("event_capacity must be greater than 0".into()));
        }

        Ok(())
    }
}
