//! In-process transport built on Tokio channels.
//!
//! Useful for hosts that bridge the provider through their own event loop,
//! and for driving the client against a scripted provider in tests.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::request::{
    BalanceNotification, InboundMessage, OutboundMessage, ProviderError, ProviderResponse,
};
use crate::transport::{ProviderTransport, TransportLink};
use crate::types::{CorrelationToken, SubscriptionId};

/// Client-side half: forwards outbound messages into a channel.
pub struct ChannelTransport {
    name: String,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

#[async_trait]
impl ProviderTransport for ChannelTransport {
    async fn send(&self, msg: OutboundMessage) -> Result<(), ConnectorError> {
        self.tx
            .send(msg)
            .map_err(|_| ConnectorError::TransportUnavailable("provider endpoint dropped".into()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Provider-side half: receives requests and emits responses/notifications.
pub struct ProviderEndpoint {
    requests: mpsc::UnboundedReceiver<OutboundMessage>,
    events: Option<mpsc::UnboundedSender<InboundMessage>>,
}

/// Create a connected transport/provider pair.
pub fn pair() -> (TransportLink, ProviderEndpoint) {
    named_pair("memory")
}

/// Like [`pair`], with a custom transport name for logs.
pub fn named_pair(name: impl Into<String>) -> (TransportLink, ProviderEndpoint) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        name: name.into(),
        tx: out_tx,
    };
    (
        TransportLink::new(Arc::new(transport), in_rx),
        ProviderEndpoint {
            requests: out_rx,
            events: Some(in_tx),
        },
    )
}

impl ProviderEndpoint {
    /// Wait for the next request from the client.
    /// Returns `None` once the client side has been dropped.
    pub async fn next_request(&mut self) -> Option<OutboundMessage> {
        self.requests.recv().await
    }

    /// Non-blocking variant of [`next_request`](Self::next_request).
    pub fn try_next_request(&mut self) -> Option<OutboundMessage> {
        self.requests.try_recv().ok()
    }

    /// Send any inbound message to the client.
    pub fn send(&self, msg: impl Into<InboundMessage>) -> Result<(), ConnectorError> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| ConnectorError::TransportUnavailable("inbound channel closed".into()))?;
        events
            .send(msg.into())
            .map_err(|_| ConnectorError::TransportUnavailable("client dropped".into()))
    }

    /// Answer a request with a successful result.
    pub fn respond<T: Serialize>(
        &self,
        token: CorrelationToken,
        result: T,
    ) -> Result<(), ConnectorError> {
        let value = serde_json::to_value(result)?;
        self.send(ProviderResponse::ok(token, value))
    }

    /// Answer a request with a provider error.
    pub fn reject(&self, token: CorrelationToken, error: ProviderError) -> Result<(), ConnectorError> {
        self.send(ProviderResponse::err(token, error))
    }

    /// Push a balance notification.
    pub fn notify(
        &self,
        subscription_id: impl Into<SubscriptionId>,
        balance: impl Into<String>,
    ) -> Result<(), ConnectorError> {
        self.send(BalanceNotification {
            subscription_id: subscription_id.into(),
            balance: balance.into(),
        })
    }

    /// Close the provider-to-client channel, as if the provider went away.
    pub fn close_inbound(&mut self) {
        self.events = None;
    }
}
