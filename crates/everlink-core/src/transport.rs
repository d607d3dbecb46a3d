//! The `ProviderTransport` trait — the only way the connector reaches the provider.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::request::{InboundMessage, OutboundMessage};

/// Outbound half of the channel to a wallet provider.
///
/// Implementations only deliver messages; correlation, timeouts and
/// subscription bookkeeping live in the client. Any `Err` from `send` is
/// treated as the transport being gone.
///
/// The trait is object-safe and can be stored as `Arc<dyn ProviderTransport>`.
#[async_trait]
pub trait ProviderTransport: Send + Sync + 'static {
    /// Hand one message to the provider.
    async fn send(&self, msg: OutboundMessage) -> Result<(), ConnectorError>;

    /// Identifier used in logs.
    fn name(&self) -> &str;
}

/// A transport plus the stream of messages the provider sends back.
///
/// The inbound channel closing is how the client learns the provider went away.
pub struct TransportLink {
    pub transport: Arc<dyn ProviderTransport>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

impl TransportLink {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Self {
        Self { transport, inbound }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("transport", &self.transport.name())
            .finish()
    }
}
