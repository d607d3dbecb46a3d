//! Connector error taxonomy.

use thiserror::Error;

use crate::request::{ProviderError, RequestMethod};

/// Errors surfaced by the connector to its immediate caller.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The operation needs an established connection.
    #[error("not connected to the wallet provider")]
    NotConnected,

    /// Another connect/disconnect/checkConnect is still in flight.
    #[error("a connection transition is already in progress")]
    AlreadyInProgress,

    /// `connect` was called while already connected.
    #[error("already connected to the wallet provider")]
    AlreadyConnected,

    /// The provider answered `connect` with `isConnected: false`.
    #[error("wallet provider rejected the connection")]
    ConnectionRejected,

    /// The transition was superseded (e.g. disconnect issued during connect).
    #[error("operation cancelled by a newer connection transition")]
    Cancelled,

    /// No response arrived within the configured window.
    #[error("{method} request timed out after {ms}ms")]
    Timeout { method: RequestMethod, ms: u64 },

    /// The channel to the provider is closed or the provider is absent.
    #[error("wallet provider transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A response contradicts the semantics of its request.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The provider answered with an error object.
    #[error("provider error {}: {}", .0.code, .0.message)]
    Provider(ProviderError),

    /// A balance listener failed. Only ever logged, never returned.
    #[error("listener for subscription {subscription} failed: {reason}")]
    ListenerFailure { subscription: String, reason: String },

    /// An argument failed validation (e.g. empty address).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A result payload could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl ConnectorError {
    /// Returns `true` if the error means the transport is unusable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }

    /// Returns `true` if the same call may succeed when issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::AlreadyInProgress | Self::Cancelled
        )
    }
}
