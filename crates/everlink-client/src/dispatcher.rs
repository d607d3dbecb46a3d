//! Request/response correlation with timeouts and transport-failure fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;

use everlink_core::{
    ClientConfig, ConnectorError, CorrelationToken, OutboundMessage, ProviderResponse,
    ProviderTransport, Request, RequestMethod,
};

type PendingMap = Mutex<HashMap<CorrelationToken, oneshot::Sender<Result<Value, ConnectorError>>>>;

/// Issues requests to the provider and pairs each with exactly one outcome.
pub struct RequestDispatcher {
    transport: Mutex<Arc<dyn ProviderTransport>>,
    pending: PendingMap,
    next_token: AtomicU64,
    degraded: AtomicBool,
    request_timeout: Duration,
    connect_timeout: Duration,
}

/// Removes the pending entry when the waiting future finishes or is dropped.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    token: CorrelationToken,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.token);
    }
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn ProviderTransport>, config: &ClientConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            degraded: AtomicBool::new(false),
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn timeout_for(&self, method: RequestMethod) -> Duration {
        match method {
            RequestMethod::Connect => self.connect_timeout,
            _ => self.request_timeout,
        }
    }

    /// Send `request` and wait for its result value.
    pub async fn send(&self, request: Request) -> Result<Value, ConnectorError> {
        if self.is_degraded() {
            return Err(ConnectorError::TransportUnavailable(
                "dispatcher degraded after transport failure".into(),
            ));
        }

        let method = request.method();
        let token = CorrelationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(token, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            token,
        };

        let transport = self.transport.lock().unwrap().clone();
        tracing::debug!(%token, %method, transport = transport.name(), "sending request");

        if let Err(e) = transport
            .send(OutboundMessage {
                request,
                correlation_token: token,
            })
            .await
        {
            let reason = e.to_string();
            self.fail_all(&reason);
            return Err(ConnectorError::TransportUnavailable(reason));
        }

        let timeout = self.timeout_for(method);
        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectorError::TransportUnavailable(
                "pending request dropped".into(),
            )),
            Err(_) => {
                tracing::debug!(%token, %method, "request timed out");
                Err(ConnectorError::Timeout {
                    method,
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send `request` and deserialize the result.
    pub async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ConnectorError> {
        let value = self.send(request).await?;
        serde_json::from_value(value).map_err(ConnectorError::Deserialization)
    }

    /// Deliver a provider response to its waiter.
    ///
    /// Returns `false` when no request is waiting on the token (unexpected,
    /// duplicate, or arrived after a timeout); such responses are dropped.
    pub fn resolve(&self, response: ProviderResponse) -> bool {
        let token = response.correlation_token;
        let Some(tx) = self.pending.lock().unwrap().remove(&token) else {
            tracing::debug!(%token, "dropping response with no pending request");
            return false;
        };
        let outcome = response.into_result().map_err(ConnectorError::Provider);
        // The waiter may have been cancelled in between; nothing to do then.
        let _ = tx.send(outcome);
        true
    }

    /// Fail every pending request with `TransportUnavailable` and refuse new
    /// requests until [`reset`](Self::reset).
    pub fn fail_all(&self, reason: &str) {
        self.degraded.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        tracing::warn!(reason, failed = drained.len(), "transport failure, dispatcher degraded");
        for (_, tx) in drained {
            let _ = tx.send(Err(ConnectorError::TransportUnavailable(reason.to_string())));
        }
    }

    /// Install a fresh transport and clear the degraded flag.
    pub fn reset(&self, transport: Arc<dyn ProviderTransport>) {
        tracing::info!(transport = transport.name(), "dispatcher reset");
        *self.transport.lock().unwrap() = transport;
        self.degraded.store(false, Ordering::SeqCst);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
