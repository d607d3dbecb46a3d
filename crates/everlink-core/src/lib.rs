//! everlink-core — wire types, transport trait and errors for the everlink
//! wallet connector.
//!
//! # Overview
//!
//! - [`Request`] / [`OutboundMessage`] / [`InboundMessage`] — wire types
//! - [`ProviderTransport`] — the async trait a provider bridge implements
//! - [`ConnectorError`] — the error taxonomy surfaced to callers
//! - [`ClientConfig`] — timeouts and network selection
//! - [`memory`] — channel-backed transport pair
//! - [`logging`] — tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod request;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use error::ConnectorError;
pub use request::{
    BalanceNotification, InboundMessage, OutboundMessage, ProviderError, ProviderResponse,
    Request, RequestMethod,
};
pub use transport::{ProviderTransport, TransportLink};
pub use types::{
    Abi, Address, ConnectResponse, ConnectedAccount, CorrelationToken, DisconnectResponse,
    NetworkKey, SubscribeResponse, SubscriptionId,
};
