//! Domain values shared by the client and the provider boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// Network context the provider should target. Passed through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKey {
    #[default]
    Mainnet,
    Devnet,
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Devnet => write!(f, "devnet"),
        }
    }
}

impl FromStr for NetworkKey {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "devnet" => Ok(Self::Devnet),
            other => Err(ConnectorError::InvalidArgument(format!(
                "unknown network key '{other}'"
            ))),
        }
    }
}

fn non_empty(kind: &str, value: String) -> Result<String, ConnectorError> {
    if value.trim().is_empty() {
        Err(ConnectorError::InvalidArgument(format!("{kind} must not be empty")))
    } else {
        Ok(value)
    }
}

/// Account address. Opaque to the connector beyond being non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Result<Self, ConnectorError> {
        non_empty("address", value.into()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = ConnectorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Address {
    type Error = ConnectorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contract ABI, carried as an opaque non-empty JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Abi(String);

impl Abi {
    pub fn new(value: impl Into<String>) -> Result<Self, ConnectorError> {
        non_empty("abi", value.into()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Abi {
    type Error = ConnectorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Abi> for String {
    fn from(a: Abi) -> Self {
        a.0
    }
}

/// Provider-assigned subscription id returned by `subscribeToBalance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token pairing an outbound request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(pub u64);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result payload of `connect` and `checkConnect`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub is_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl ConnectResponse {
    /// A connected report for `address`.
    pub fn connected(address: impl Into<String>, public_key: Option<String>) -> Self {
        Self {
            is_connected: true,
            address: Some(address.into()),
            public_key,
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Extract the account of a connected report.
    ///
    /// Fails with `ProtocolViolation` when `isConnected` is true but the
    /// address is missing or empty. Returns `Ok(None)` for a disconnected report.
    pub fn account(&self) -> Result<Option<ConnectedAccount>, ConnectorError> {
        if !self.is_connected {
            return Ok(None);
        }
        let address = self
            .address
            .clone()
            .ok_or_else(|| {
                ConnectorError::ProtocolViolation("connected response without address".into())
            })
            .and_then(|a| {
                Address::new(a).map_err(|_| {
                    ConnectorError::ProtocolViolation("connected response with empty address".into())
                })
            })?;
        Ok(Some(ConnectedAccount {
            address,
            public_key: self.public_key.clone(),
        }))
    }
}

/// Result payload of `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub is_connected: bool,
}

/// Result payload of `subscribeToBalance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscription_id: SubscriptionId,
}

/// The account a connected session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAccount {
    pub address: Address,
    pub public_key: Option<String>,
}
