//! `WalletClient` — the application-facing connector.
//!
//! Owns one dispatcher, connection state machine and subscription registry,
//! plus a background task that routes everything the provider sends.

use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

use everlink_core::{
    Address, ClientConfig, ConnectResponse, ConnectedAccount, ConnectorError, DisconnectResponse,
    InboundMessage, NetworkKey, Request, SubscribeResponse, SubscriptionId, TransportLink,
};

use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::dispatcher::RequestDispatcher;
use crate::subscriptions::{
    Activation, Removal, SubscribeParams, SubscriptionHandle, SubscriptionRegistry,
};

struct ClientInner {
    config: ClientConfig,
    dispatcher: RequestDispatcher,
    connection: ConnectionStateMachine,
    subscriptions: SubscriptionRegistry,
    /// Incremented on every `reattach`; a pump only acts for its own link.
    link_epoch: AtomicU64,
    pump_stop: Mutex<Arc<Notify>>,
}

impl ClientInner {
    /// Send a request on the current link; a transport failure resets the
    /// session.
    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ConnectorError> {
        let epoch = self.link_epoch.load(Ordering::SeqCst);
        let outcome = self.dispatcher.call(request).await;
        if matches!(&outcome, Err(e) if e.is_transport_failure()) {
            self.transport_lost(epoch);
        }
        outcome
    }

    /// The link of `epoch` is unusable, so the provider session is gone with
    /// it: go `Disconnected` and drop every subscription. No-op once the link
    /// has been replaced.
    fn transport_lost(&self, epoch: u64) {
        if self.link_epoch.load(Ordering::SeqCst) != epoch || !self.dispatcher.is_degraded() {
            return;
        }
        let was_connected = self.connection.force_disconnect();
        let dropped = self.subscriptions.clear_all();
        tracing::warn!(was_connected, dropped, "transport lost, session reset");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pump_stop.lock().unwrap().notify_one();
    }
}

/// Client for an injected wallet provider.
///
/// Cheap to clone; clones share the same session. Independent instances
/// are fully isolated from each other.
#[derive(Clone)]
pub struct WalletClient {
    inner: Arc<ClientInner>,
}

/// A subscribe request on its way to the provider.
///
/// The handle is usable for removal right away. Awaiting yields the handle
/// once the provider has confirmed, or the error that prevented it.
pub struct PendingSubscription {
    handle: SubscriptionHandle,
    outcome: oneshot::Receiver<Result<SubscriptionHandle, ConnectorError>>,
}

impl PendingSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Wait for the provider to confirm the subscription.
    ///
    /// Resolves to `Cancelled` if the subscription was removed first.
    pub async fn confirmed(self) -> Result<SubscriptionHandle, ConnectorError> {
        self.outcome.await.unwrap_or(Err(ConnectorError::Cancelled))
    }
}

impl IntoFuture for PendingSubscription {
    type Output = Result<SubscriptionHandle, ConnectorError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.confirmed().boxed()
    }
}

impl WalletClient {
    /// Create a client over `link` and start routing inbound messages.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(link: TransportLink, config: ClientConfig) -> Result<Self, ConnectorError> {
        config.validate()?;
        let TransportLink { transport, inbound } = link;
        let stop = Arc::new(Notify::new());
        let inner = Arc::new(ClientInner {
            dispatcher: RequestDispatcher::new(transport, &config),
            connection: ConnectionStateMachine::new(config.state_channel_capacity),
            subscriptions: SubscriptionRegistry::new(config.early_notification_limit),
            link_epoch: AtomicU64::new(0),
            pump_stop: Mutex::new(stop.clone()),
            config,
        });
        tokio::spawn(inbound_task(Arc::downgrade(&inner), inbound, stop, 0));
        Ok(Self { inner })
    }

    /// Ask the provider for a session on the configured network.
    pub async fn connect(&self) -> Result<ConnectedAccount, ConnectorError> {
        let ticket = self.inner.connection.begin_connect()?;
        let inner = self.inner.clone();
        run_detached(async move {
            let outcome = inner
                .call::<ConnectResponse>(Request::Connect {
                    network: inner.config.network,
                })
                .await;
            inner.connection.finish_connect(ticket, outcome)
        })
        .await
    }

    /// End the session. Local subscriptions are dropped without unsubscribing.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let ticket = self.inner.connection.begin_disconnect()?;
        self.inner.subscriptions.clear_all();
        let inner = self.inner.clone();
        run_detached(async move {
            let outcome = inner
                .call::<DisconnectResponse>(Request::Disconnect)
                .await;
            inner.connection.finish_disconnect(ticket, outcome)
        })
        .await
    }

    /// Ask the provider whether the session is live and resync local state.
    pub async fn check_connect(&self) -> Result<ConnectionState, ConnectorError> {
        let ticket = self.inner.connection.begin_check()?;
        let inner = self.inner.clone();
        run_detached(async move {
            let outcome = inner
                .call::<ConnectResponse>(Request::CheckConnect)
                .await;
            let checked = inner.connection.finish_check(ticket, outcome)?;
            if checked.session_lost {
                inner.subscriptions.clear_all();
            }
            Ok(checked.state)
        })
        .await
    }

    /// Start a balance subscription.
    ///
    /// Fails with `NotConnected` without contacting the provider unless the
    /// client is connected over a working transport. Must be called within a
    /// Tokio runtime.
    pub fn subscribe(&self, params: SubscribeParams) -> Result<PendingSubscription, ConnectorError> {
        if !self.inner.connection.can_subscribe() || self.inner.dispatcher.is_degraded() {
            return Err(ConnectorError::NotConnected);
        }
        let SubscribeParams {
            address, listener, ..
        } = params;
        let handle = self.inner.subscriptions.reserve(address.clone(), listener);
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let outcome = inner
                .call::<SubscribeResponse>(Request::SubscribeToBalance { address })
                .await;
            let result = match outcome {
                Ok(resp) => match inner.subscriptions.activate(handle, resp.subscription_id) {
                    Activation::Active => Ok(handle),
                    Activation::Orphaned(id) => {
                        release(&inner, id);
                        Err(ConnectorError::Cancelled)
                    }
                    Activation::Discarded => Err(ConnectorError::Cancelled),
                },
                Err(e) => {
                    tracing::warn!(%handle, error = %e, retryable = e.is_retryable(), "balance subscription failed");
                    inner.subscriptions.fail(handle);
                    Err(e)
                }
            };
            let _ = tx.send(result);
        });

        Ok(PendingSubscription {
            handle,
            outcome: rx,
        })
    }

    /// Stop a subscription. Idempotent and never fails; local delivery stops
    /// before this returns, the provider is told in the background.
    pub fn remove(&self, handle: SubscriptionHandle) {
        match self.inner.subscriptions.remove(handle) {
            Removal::Unsubscribe(id) => release(&self.inner, id),
            Removal::Shared | Removal::Deferred | Removal::NotFound => {}
        }
    }

    /// Swap in a new transport after the old one failed.
    ///
    /// The provider session is assumed gone: state becomes `Disconnected`,
    /// subscriptions are dropped, and requests still pending on the old
    /// link fail with `TransportUnavailable`.
    pub fn reattach(&self, link: TransportLink) {
        let TransportLink { transport, inbound } = link;
        let epoch = self.inner.link_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let stop = Arc::new(Notify::new());
        let old = std::mem::replace(&mut *self.inner.pump_stop.lock().unwrap(), stop.clone());
        old.notify_one();

        self.inner.connection.force_disconnect();
        self.inner.subscriptions.clear_all();
        self.inner.dispatcher.fail_all("transport replaced");
        self.inner.dispatcher.reset(transport);

        tokio::spawn(inbound_task(Arc::downgrade(&self.inner), inbound, stop, epoch));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Every subsequent state change, in order.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// The connected account, while `Connected`.
    pub fn account(&self) -> Option<ConnectedAccount> {
        self.inner.connection.account()
    }

    pub fn network(&self) -> NetworkKey {
        self.inner.config.network
    }

    /// `true` after a transport failure, until `reattach`.
    pub fn is_degraded(&self) -> bool {
        self.inner.dispatcher.is_degraded()
    }

    /// Subscriptions reserved or active.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Live subscriptions on `address`.
    pub fn subscriptions_for(&self, address: &Address) -> Vec<SubscriptionHandle> {
        self.inner.subscriptions.handles_for(address)
    }

    /// Requests awaiting a provider response.
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_len()
    }
}

/// Run a state transition to completion even if the caller stops waiting,
/// so a dropped future never leaves a transition half-applied.
async fn run_detached<T, F>(fut: F) -> Result<T, ConnectorError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ConnectorError>> + Send + 'static,
{
    tokio::spawn(fut).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "transition task failed");
        Err(ConnectorError::Cancelled)
    })
}

/// Release a provider subscription in the background; failures are logged.
fn release(inner: &Arc<ClientInner>, id: SubscriptionId) {
    if !inner.connection.is_connected() {
        tracing::debug!(subscription = %id, "session gone, skipping unsubscribe");
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(subscription = %id, "no runtime, unsubscribe not sent");
        return;
    };
    let inner = inner.clone();
    runtime.spawn(async move {
        let request = Request::UnsubscribeFromBalance {
            subscription_id: id.clone(),
        };
        if let Err(e) = inner.call::<serde_json::Value>(request).await {
            tracing::warn!(subscription = %id, error = %e, "unsubscribe failed");
        }
    });
}

/// Routes provider messages until the link closes or is replaced.
async fn inbound_task(
    client: Weak<ClientInner>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    stop: Arc<Notify>,
    epoch: u64,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => return,
            msg = inbound.recv() => {
                let Some(inner) = client.upgrade() else { return };
                if inner.link_epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match msg {
                    Some(InboundMessage::Response(resp)) => {
                        inner.dispatcher.resolve(resp);
                    }
                    Some(InboundMessage::Notification(note)) => {
                        inner.subscriptions.dispatch(note);
                    }
                    None => {
                        inner.dispatcher.fail_all("provider closed the inbound channel");
                        inner.transport_lost(epoch);
                        return;
                    }
                }
            }
        }
    }
}
