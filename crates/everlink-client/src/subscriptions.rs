//! Balance subscription registry.
//!
//! Tracks local subscriptions, binds them to provider-assigned ids, and
//! delivers notifications through one FIFO queue and delivery task per
//! subscription. A slow listener only delays its own subscription.
//!
//! Each subscription goes through `reserve` (before the provider is asked),
//! then exactly one of `activate` / `fail` once the provider answers.
//! `remove` may happen at any point in between.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use everlink_core::{Address, BalanceNotification, ConnectorError, SubscriptionId};

use crate::listener::BalanceListener;

/// Caller-side reference to a subscription. Removal goes through the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// What a subscription watches. Only balances today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeKind {
    Balance,
}

/// Arguments of `WalletClient::subscribe`.
#[derive(Clone)]
pub struct SubscribeParams {
    pub kind: SubscribeKind,
    pub address: Address,
    pub listener: Arc<dyn BalanceListener>,
}

impl SubscribeParams {
    pub fn balance(address: Address, listener: Arc<dyn BalanceListener>) -> Self {
        Self {
            kind: SubscribeKind::Balance,
            address,
            listener,
        }
    }
}

impl fmt::Debug for SubscribeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeParams")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .finish()
    }
}

/// Result of binding a reservation to its provider id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// The subscription is live.
    Active,
    /// Removed while pending; the provider subscription must be released.
    Orphaned(SubscriptionId),
    /// Removed while pending; another live subscription still uses the id.
    Discarded,
}

/// Result of `remove`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Last local user of the id; send `unsubscribeFromBalance`.
    Unsubscribe(SubscriptionId),
    /// Other local subscriptions still use the id.
    Shared,
    /// Provider has not confirmed yet; handled at activation.
    Deferred,
    /// Unknown or already removed.
    NotFound,
}

enum Binding {
    Pending,
    Active(SubscriptionId),
}

struct SubscriptionEntry {
    address: Address,
    binding: Binding,
    active: Arc<AtomicBool>,
    queue: mpsc::UnboundedSender<String>,
}

impl SubscriptionEntry {
    fn deactivate(self) {
        self.active.store(false, Ordering::SeqCst);
        // dropping `queue` ends the delivery task
    }
}

#[derive(Default)]
struct RegistryInner {
    next_handle: u64,
    entries: HashMap<SubscriptionHandle, SubscriptionEntry>,
    by_id: HashMap<SubscriptionId, Vec<SubscriptionHandle>>,
    by_address: HashMap<Address, Vec<SubscriptionHandle>>,
    /// Subscribe requests still waiting for the provider.
    outstanding: usize,
    /// Notifications for ids not bound yet, kept while `outstanding > 0`.
    early: HashMap<SubscriptionId, VecDeque<String>>,
    /// Ids given back to the provider, newest last; never buffered.
    released: VecDeque<SubscriptionId>,
}

/// How many released ids are remembered.
const RELEASED_MEMORY: usize = 64;

impl RegistryInner {
    fn mark_released(&mut self, id: &SubscriptionId) {
        self.early.remove(id);
        if self.released.len() == RELEASED_MEMORY {
            self.released.pop_front();
        }
        self.released.push_back(id.clone());
    }
}

/// Owns every subscription and its delivery task.
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    early_limit: usize,
}

impl SubscriptionRegistry {
    pub fn new(early_limit: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            early_limit,
        }
    }

    /// Create a pending subscription and start its delivery task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn reserve(&self, address: Address, listener: Arc<dyn BalanceListener>) -> SubscriptionHandle {
        let (queue, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        inner.outstanding += 1;
        inner.entries.insert(
            handle,
            SubscriptionEntry {
                address,
                binding: Binding::Pending,
                active: active.clone(),
                queue,
            },
        );
        drop(inner);

        tokio::spawn(deliver(handle, listener, rx, active));
        handle
    }

    /// Bind a reservation to the id the provider assigned.
    pub fn activate(&self, handle: SubscriptionHandle, id: SubscriptionId) -> Activation {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.outstanding = inner.outstanding.saturating_sub(1);
        let buffered = inner.early.remove(&id);
        // reissued by the provider
        inner.released.retain(|r| *r != id);

        let outcome = match inner.entries.get_mut(&handle) {
            Some(entry) => {
                entry.binding = Binding::Active(id.clone());
                for balance in buffered.into_iter().flatten() {
                    let _ = entry.queue.send(balance);
                }
                inner
                    .by_address
                    .entry(entry.address.clone())
                    .or_default()
                    .push(handle);
                inner.by_id.entry(id.clone()).or_default().push(handle);
                tracing::debug!(%handle, subscription = %id, "subscription active");
                Activation::Active
            }
            None if inner.by_id.contains_key(&id) => Activation::Discarded,
            None => {
                inner.mark_released(&id);
                Activation::Orphaned(id)
            }
        };

        if inner.outstanding == 0 {
            inner.early.clear();
        }
        outcome
    }

    /// The subscribe request failed; drop the reservation.
    pub fn fail(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if let Some(entry) = inner.entries.remove(&handle) {
            entry.deactivate();
        }
        if inner.outstanding == 0 {
            inner.early.clear();
        }
    }

    /// Stop local delivery immediately. Idempotent.
    pub fn remove(&self, handle: SubscriptionHandle) -> Removal {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let Some(entry) = inner.entries.remove(&handle) else {
            return Removal::NotFound;
        };
        let address = entry.address.clone();
        let id = match &entry.binding {
            Binding::Pending => None,
            Binding::Active(id) => Some(id.clone()),
        };
        entry.deactivate();

        let Some(id) = id else {
            return Removal::Deferred;
        };
        if let Some(handles) = inner.by_address.get_mut(&address) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                inner.by_address.remove(&address);
            }
        }
        let last = match inner.by_id.get_mut(&id) {
            Some(handles) => {
                handles.retain(|h| *h != handle);
                handles.is_empty()
            }
            None => true,
        };
        if last {
            inner.by_id.remove(&id);
            inner.mark_released(&id);
            Removal::Unsubscribe(id)
        } else {
            Removal::Shared
        }
    }

    /// Route a provider notification to every subscription bound to its id.
    /// Returns how many subscriptions it was queued for.
    pub fn dispatch(&self, notification: BalanceNotification) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let BalanceNotification {
            subscription_id,
            balance,
        } = notification;

        if let Some(handles) = inner.by_id.get(&subscription_id) {
            for handle in handles {
                if let Some(entry) = inner.entries.get(handle) {
                    let _ = entry.queue.send(balance.clone());
                }
            }
            return handles.len();
        }

        if inner.released.contains(&subscription_id) {
            tracing::debug!(subscription = %subscription_id, "dropping notification for released subscription");
        } else if inner.outstanding > 0 && self.early_limit > 0 {
            let buffer = inner.early.entry(subscription_id.clone()).or_default();
            if buffer.len() == self.early_limit {
                buffer.pop_front();
            }
            buffer.push_back(balance);
            tracing::debug!(subscription = %subscription_id, "buffering notification until subscribe resolves");
        } else {
            tracing::debug!(subscription = %subscription_id, "dropping notification for unknown subscription");
        }
        0
    }

    /// Deactivate everything without provider round trips. Returns how many
    /// subscriptions were dropped.
    pub fn clear_all(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        for (_, entry) in inner.entries.drain() {
            entry.deactivate();
        }
        let ids: Vec<SubscriptionId> = inner.by_id.drain().map(|(id, _)| id).collect();
        for id in &ids {
            inner.mark_released(id);
        }
        inner.by_address.clear();
        inner.early.clear();
        if count > 0 {
            tracing::info!(count, "cleared subscriptions");
        }
        count
    }

    /// Live subscriptions on `address`.
    pub fn handles_for(&self, address: &Address) -> Vec<SubscriptionHandle> {
        self.inner
            .lock()
            .unwrap()
            .by_address
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscription_id(&self, handle: SubscriptionHandle) -> Option<SubscriptionId> {
        match &self.inner.lock().unwrap().entries.get(&handle)?.binding {
            Binding::Active(id) => Some(id.clone()),
            Binding::Pending => None,
        }
    }

    /// `true` while the handle is reserved or active.
    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.inner.lock().unwrap().entries.contains_key(&handle)
    }

    /// Number of reserved or active subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn deliver(
    handle: SubscriptionHandle,
    listener: Arc<dyn BalanceListener>,
    mut rx: mpsc::UnboundedReceiver<String>,
    active: Arc<AtomicBool>,
) {
    while let Some(balance) = rx.recv().await {
        if !active.load(Ordering::SeqCst) {
            break;
        }
        let reason = match AssertUnwindSafe(listener.on_balance(balance))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "listener panicked".to_string(),
        };
        let failure = ConnectorError::ListenerFailure {
            subscription: handle.to_string(),
            reason,
        };
        tracing::warn!(error = %failure, "balance listener failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::listener::{from_async_fn, from_fn};

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn note(id: &str, balance: &str) -> BalanceNotification {
        BalanceNotification {
            subscription_id: id.into(),
            balance: balance.into(),
        }
    }

    fn recording() -> (Arc<dyn BalanceListener>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = from_fn(move |b| {
            let _ = tx.send(b);
            Ok(())
        });
        (listener, rx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn activate_and_dispatch() {
        let reg = SubscriptionRegistry::new(8);
        let (listener, mut rx) = recording();
        let h = reg.reserve(addr("0xA"), listener);
        assert_eq!(reg.subscription_id(h), None);

        assert_eq!(reg.activate(h, "s1".into()), Activation::Active);
        assert_eq!(reg.subscription_id(h), Some("s1".into()));
        assert_eq!(reg.handles_for(&addr("0xA")), vec![h]);

        assert_eq!(reg.dispatch(note("s1", "100")), 1);
        assert_eq!(rx.recv().await.unwrap(), "100");
        assert_eq!(reg.dispatch(note("other", "1")), 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_stops_delivery() {
        let reg = SubscriptionRegistry::new(8);
        let (listener, mut rx) = recording();
        let h = reg.reserve(addr("0xA"), listener);
        reg.activate(h, "s1".into());

        assert_eq!(reg.remove(h), Removal::Unsubscribe("s1".into()));
        assert_eq!(reg.remove(h), Removal::NotFound);
        assert_eq!(reg.dispatch(note("s1", "200")), 0);
        // delivery task ends once the queue is dropped
        assert!(rx.recv().await.is_none());
        assert!(reg.is_empty());
        assert!(reg.handles_for(&addr("0xA")).is_empty());
    }

    #[tokio::test]
    async fn queued_notifications_are_not_delivered_after_remove() {
        let reg = SubscriptionRegistry::new(8);
        let (listener, mut rx) = recording();
        let h = reg.reserve(addr("0xA"), listener);
        reg.activate(h, "s1".into());

        // queued but not yet delivered: the delivery task has not run
        reg.dispatch(note("s1", "1"));
        reg.dispatch(note("s1", "2"));
        reg.remove(h);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn remove_before_activation_orphans_provider_id() {
        let reg = SubscriptionRegistry::new(8);
        let (listener, _rx) = recording();
        let h = reg.reserve(addr("0xA"), listener);
        assert_eq!(reg.remove(h), Removal::Deferred);
        assert_eq!(reg.activate(h, "s9".into()), Activation::Orphaned("s9".into()));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn shared_provider_id_unsubscribes_on_last_removal() {
        let reg = SubscriptionRegistry::new(8);
        let (l1, mut rx1) = recording();
        let (l2, mut rx2) = recording();
        let h1 = reg.reserve(addr("0xA"), l1);
        let h2 = reg.reserve(addr("0xA"), l2);
        reg.activate(h1, "s1".into());
        reg.activate(h2, "s1".into());

        assert_eq!(reg.dispatch(note("s1", "5")), 2);
        assert_eq!(rx1.recv().await.unwrap(), "5");
        assert_eq!(rx2.recv().await.unwrap(), "5");

        assert_eq!(reg.remove(h1), Removal::Shared);
        assert_eq!(reg.dispatch(note("s1", "6")), 1);
        assert_eq!(rx2.recv().await.unwrap(), "6");
        assert_eq!(reg.remove(h2), Removal::Unsubscribe("s1".into()));
    }

    #[tokio::test]
    async fn early_notifications_replayed_on_activation() {
        let reg = SubscriptionRegistry::new(2);
        let (listener, mut rx) = recording();
        let h = reg.reserve(addr("0xA"), listener);

        reg.dispatch(note("s1", "1"));
        reg.dispatch(note("s1", "2"));
        reg.dispatch(note("s1", "3"));
        reg.activate(h, "s1".into());

        // oldest dropped at the limit
        assert_eq!(rx.recv().await.unwrap(), "2");
        assert_eq!(rx.recv().await.unwrap(), "3");
    }

    #[tokio::test]
    async fn released_id_is_not_replayed_to_a_new_subscription() {
        let reg = SubscriptionRegistry::new(8);
        let (l1, _rx1) = recording();
        let (l2, mut rx2) = recording();
        let old = reg.reserve(addr("0xA"), l1);
        reg.activate(old, "s1".into());
        assert_eq!(reg.remove(old), Removal::Unsubscribe("s1".into()));

        // stale balance for the released id while a new subscribe is out
        let new = reg.reserve(addr("0xA"), l2);
        reg.dispatch(note("s1", "stale"));
        assert_eq!(reg.activate(new, "s1".into()), Activation::Active);

        reg.dispatch(note("s1", "fresh"));
        assert_eq!(rx2.recv().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn unknown_notifications_dropped_without_pending_subscribe() {
        let reg = SubscriptionRegistry::new(8);
        let (listener, mut rx) = recording();
        reg.dispatch(note("s1", "1"));
        let h = reg.reserve(addr("0xA"), listener);
        reg.activate(h, "s1".into());
        reg.dispatch(note("s1", "2"));
        assert_eq!(rx.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn failed_listener_does_not_stop_delivery() {
        let reg = SubscriptionRegistry::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = from_fn(move |b: String| {
            if b == "panic" {
                panic!("listener bug");
            }
            if b == "err" {
                anyhow::bail!("bad balance");
            }
            let _ = tx.send(b);
            Ok(())
        });
        let h = reg.reserve(addr("0xA"), listener);
        reg.activate(h, "s1".into());

        reg.dispatch(note("s1", "err"));
        reg.dispatch(note("s1", "panic"));
        reg.dispatch(note("s1", "ok"));
        assert_eq!(rx.recv().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn per_subscription_calls_are_serialized_in_order() {
        let reg = SubscriptionRegistry::new(8);
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = from_async_fn(move |b: String| {
            let busy = busy.clone();
            let tx = tx.clone();
            async move {
                assert!(!busy.swap(true, Ordering::SeqCst), "overlapping delivery");
                tokio::time::sleep(Duration::from_millis(5)).await;
                busy.store(false, Ordering::SeqCst);
                let _ = tx.send(b);
                Ok(())
            }
        });
        let h = reg.reserve(addr("0xA"), listener);
        reg.activate(h, "s1".into());
        for i in 0..5 {
            reg.dispatch(note("s1", &i.to_string()));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), i.to_string());
        }
    }

    #[tokio::test]
    async fn slow_listener_does_not_block_other_subscriptions() {
        let reg = SubscriptionRegistry::new(8);
        let gate = Arc::new(tokio::sync::Notify::new());
        let g = gate.clone();
        let stuck = from_async_fn(move |_b: String| {
            let g = g.clone();
            async move {
                g.notified().await;
                Ok(())
            }
        });
        let (fast, mut rx) = recording();

        let h1 = reg.reserve(addr("0xA"), stuck);
        let h2 = reg.reserve(addr("0xB"), fast);
        reg.activate(h1, "s1".into());
        reg.activate(h2, "s2".into());

        reg.dispatch(note("s1", "1"));
        settle().await;
        reg.dispatch(note("s2", "2"));
        assert_eq!(rx.recv().await.unwrap(), "2");
        gate.notify_one();
    }

    #[tokio::test]
    async fn clear_all_deactivates_everything() {
        let reg = SubscriptionRegistry::new(8);
        let (l1, mut rx1) = recording();
        let (l2, _rx2) = recording();
        let h1 = reg.reserve(addr("0xA"), l1);
        let h2 = reg.reserve(addr("0xB"), l2);
        reg.activate(h1, "s1".into());

        assert_eq!(reg.clear_all(), 2);
        assert_eq!(reg.dispatch(note("s1", "1")), 0);
        assert!(rx1.recv().await.is_none());
        assert_eq!(reg.remove(h1), Removal::NotFound);
        // the still-pending subscribe resolves into an orphan
        assert_eq!(reg.activate(h2, "s2".into()), Activation::Orphaned("s2".into()));
    }
}
