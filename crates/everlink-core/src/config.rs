//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConnectorError;
use crate::types::NetworkKey;

/// Configuration for a `WalletClient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Network context passed to the provider on `connect`
    #[serde(default)]
    pub network: NetworkKey,
    /// Timeout for every request except `connect`, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Timeout for `connect`, which usually waits on user approval
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Notifications buffered per unknown subscription id while a subscribe is pending
    #[serde(default = "default_early_notification_limit")]
    pub early_notification_limit: usize,
    /// Capacity of the connection state broadcast channel
    #[serde(default = "default_state_channel_capacity")]
    pub state_channel_capacity: usize,
}

fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_connect_timeout_ms() -> u64 { 120_000 }
fn default_early_notification_limit() -> usize { 32 }
fn default_state_channel_capacity() -> usize { 64 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkKey::default(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            early_notification_limit: default_early_notification_limit(),
            state_channel_capacity: default_state_channel_capacity(),
        }
    }
}

impl ClientConfig {
    /// Default config targeting `network`.
    pub fn for_network(network: NetworkKey) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(text: &str) -> Result<Self, ConnectorError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| ConnectorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.request_timeout_ms == 0 {
            return Err(ConnectorError::Config("request_timeout_ms must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConnectorError::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.state_channel_capacity == 0 {
            return Err(ConnectorError::Config("state_channel_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
