//! Connection state machine: `Disconnected → Connecting → Connected → Disconnected`.
//!
//! Pure bookkeeping. The client brackets every provider round trip with a
//! `begin_*` call, which validates and records the transition, and the
//! matching `finish_*` call, which applies the provider's answer. At most one
//! transition is in flight; the only permitted overlap is a disconnect that
//! supersedes a pending connect.
//!
//! A disconnect ends `Disconnected` even when the provider never acknowledges
//! it (timeout, transport failure); the caller still gets that error.
//! Losing the transport forces `Disconnected` via `force_disconnect`.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::broadcast;

use everlink_core::{ConnectResponse, ConnectedAccount, ConnectorError, DisconnectResponse};

/// Connection state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Connect,
    Disconnect,
    Check,
}

/// Proof that a transition was started; handed back to the matching `finish_*`.
#[derive(Debug)]
#[must_use]
pub struct Ticket {
    kind: Transition,
    epoch: u64,
}

/// What a `checkConnect` reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub state: ConnectionState,
    /// The provider no longer has the session we thought was live.
    pub session_lost: bool,
}

struct ConnectionInner {
    state: ConnectionState,
    account: Option<ConnectedAccount>,
    in_flight: Option<Transition>,
    /// Bumped whenever an in-flight transition is invalidated.
    epoch: u64,
}

pub struct ConnectionStateMachine {
    inner: Mutex<ConnectionInner>,
    events: broadcast::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                account: None,
                in_flight: None,
                epoch: 0,
            }),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connected, with no disconnect under way.
    pub fn can_subscribe(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == ConnectionState::Connected && inner.in_flight != Some(Transition::Disconnect)
    }

    pub fn account(&self) -> Option<ConnectedAccount> {
        self.inner.lock().unwrap().account.clone()
    }

    /// Receive every subsequent state change, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    fn set_state(&self, inner: &mut ConnectionInner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        tracing::info!(from = %inner.state, to = %next, "connection state changed");
        inner.state = next;
        // No receivers is fine.
        let _ = self.events.send(next);
    }

    fn ticket(inner: &mut ConnectionInner, kind: Transition) -> Ticket {
        inner.in_flight = Some(kind);
        Ticket {
            kind,
            epoch: inner.epoch,
        }
    }

    /// Whether `ticket` still owns the in-flight slot.
    fn is_current(inner: &ConnectionInner, ticket: &Ticket) -> bool {
        inner.epoch == ticket.epoch && inner.in_flight == Some(ticket.kind)
    }

    pub fn begin_connect(&self) -> Result<Ticket, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ConnectionState::Connected => return Err(ConnectorError::AlreadyConnected),
            ConnectionState::Connecting => return Err(ConnectorError::AlreadyInProgress),
            ConnectionState::Disconnected if inner.in_flight.is_some() => {
                return Err(ConnectorError::AlreadyInProgress)
            }
            ConnectionState::Disconnected => {}
        }
        inner.epoch += 1;
        self.set_state(&mut inner, ConnectionState::Connecting);
        Ok(Self::ticket(&mut inner, Transition::Connect))
    }

    pub fn finish_connect(
        &self,
        ticket: Ticket,
        outcome: Result<ConnectResponse, ConnectorError>,
    ) -> Result<ConnectedAccount, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        if !Self::is_current(&inner, &ticket) {
            tracing::debug!("discarding superseded connect outcome");
            return Err(superseded(outcome));
        }
        inner.in_flight = None;

        let account = outcome.and_then(|resp| match resp.account()? {
            Some(account) => Ok(account),
            None => Err(ConnectorError::ConnectionRejected),
        });
        match account {
            Ok(account) => {
                inner.account = Some(account.clone());
                self.set_state(&mut inner, ConnectionState::Connected);
                Ok(account)
            }
            Err(e) => {
                inner.account = None;
                self.set_state(&mut inner, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn begin_disconnect(&self) -> Result<Ticket, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        match (inner.state, inner.in_flight) {
            (_, Some(Transition::Disconnect | Transition::Check)) => {
                Err(ConnectorError::AlreadyInProgress)
            }
            (ConnectionState::Disconnected, _) => Err(ConnectorError::NotConnected),
            (ConnectionState::Connecting, _) => {
                // supersede the pending connect
                inner.epoch += 1;
                Ok(Self::ticket(&mut inner, Transition::Disconnect))
            }
            (ConnectionState::Connected, _) => Ok(Self::ticket(&mut inner, Transition::Disconnect)),
        }
    }

    /// Always ends `Disconnected`, acknowledged or not; the returned error
    /// reports what went wrong.
    pub fn finish_disconnect(
        &self,
        ticket: Ticket,
        outcome: Result<DisconnectResponse, ConnectorError>,
    ) -> Result<(), ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        if Self::is_current(&inner, &ticket) {
            inner.in_flight = None;
            inner.account = None;
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
        match outcome? {
            DisconnectResponse { is_connected: false } => Ok(()),
            DisconnectResponse { is_connected: true } => Err(ConnectorError::ProtocolViolation(
                "disconnect acknowledged with isConnected=true".into(),
            )),
        }
    }

    pub fn begin_check(&self) -> Result<Ticket, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_flight.is_some() {
            return Err(ConnectorError::AlreadyInProgress);
        }
        Ok(Self::ticket(&mut inner, Transition::Check))
    }

    /// Reconcile local state with the provider's report.
    pub fn finish_check(
        &self,
        ticket: Ticket,
        outcome: Result<ConnectResponse, ConnectorError>,
    ) -> Result<CheckOutcome, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        if !Self::is_current(&inner, &ticket) {
            return Err(superseded(outcome));
        }
        inner.in_flight = None;

        let reported = outcome?.account()?;
        let mut session_lost = false;
        match reported {
            Some(account) => {
                if inner.state != ConnectionState::Connected {
                    tracing::info!(address = %account.address, "provider reports connected, resyncing");
                }
                inner.account = Some(account);
                self.set_state(&mut inner, ConnectionState::Connected);
            }
            None => {
                if inner.state == ConnectionState::Connected {
                    tracing::info!("provider reports disconnected, resyncing");
                    session_lost = true;
                }
                inner.account = None;
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
        }
        Ok(CheckOutcome {
            state: inner.state,
            session_lost,
        })
    }

    /// Drop any in-flight transition and go `Disconnected`.
    /// Returns `true` if a session was live.
    pub fn force_disconnect(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_connected = inner.state == ConnectionState::Connected;
        inner.epoch += 1;
        inner.in_flight = None;
        inner.account = None;
        self.set_state(&mut inner, ConnectionState::Disconnected);
        was_connected
    }
}

/// Error for an outcome whose transition was invalidated: a request failure
/// is reported as is, a late success as `Cancelled`.
fn superseded<T>(outcome: Result<T, ConnectorError>) -> ConnectorError {
    match outcome {
        Ok(_) => ConnectorError::Cancelled,
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sm() -> ConnectionStateMachine {
        ConnectionStateMachine::new(16)
    }

    fn connect_ok(sm: &ConnectionStateMachine) -> ConnectedAccount {
        let t = sm.begin_connect().unwrap();
        sm.finish_connect(t, Ok(ConnectResponse::connected("0xA", Some("pk".into()))))
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
        let mut out = vec![];
        while let Ok(s) = rx.try_recv() {
            out.push(s);
        }
        out
    }

    #[test]
    fn connect_success() {
        let sm = sm();
        let account = connect_ok(&sm);
        assert_eq!(account.address.as_str(), "0xA");
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(sm.account(), Some(account));
    }

    #[test]
    fn second_connect_refused_without_new_ticket() {
        let sm = sm();
        let t = sm.begin_connect().unwrap();
        assert!(matches!(sm.begin_connect(), Err(ConnectorError::AlreadyInProgress)));
        sm.finish_connect(t, Ok(ConnectResponse::connected("0xA", None))).unwrap();
        assert!(matches!(sm.begin_connect(), Err(ConnectorError::AlreadyConnected)));
    }

    #[test]
    fn rejected_connect_returns_to_disconnected() {
        let sm = sm();
        let t = sm.begin_connect().unwrap();
        let err = sm.finish_connect(t, Ok(ConnectResponse::disconnected())).unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionRejected));
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        let t = sm.begin_connect().unwrap();
        let err = sm
            .finish_connect(t, Err(ConnectorError::TransportUnavailable("gone".into())))
            .unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_disconnect_connect_emits_every_state() {
        let sm = sm();
        let mut rx = sm.subscribe();
        connect_ok(&sm);
        let t = sm.begin_disconnect().unwrap();
        sm.finish_disconnect(t, Ok(DisconnectResponse { is_connected: false })).unwrap();
        connect_ok(&sm);
        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn disconnect_requires_session() {
        let sm = sm();
        assert!(matches!(sm.begin_disconnect(), Err(ConnectorError::NotConnected)));
    }

    #[test]
    fn still_connected_ack_is_violation_but_disconnects() {
        let sm = sm();
        connect_ok(&sm);
        assert!(sm.can_subscribe());
        let t = sm.begin_disconnect().unwrap();
        assert!(!sm.can_subscribe());
        assert!(matches!(sm.begin_disconnect(), Err(ConnectorError::AlreadyInProgress)));
        let err = sm
            .finish_disconnect(t, Ok(DisconnectResponse { is_connected: true }))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ProtocolViolation(_)));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.account().is_none());
    }

    #[test]
    fn disconnect_supersedes_pending_connect() {
        let sm = sm();
        let connect = sm.begin_connect().unwrap();
        let disconnect = sm.begin_disconnect().unwrap();
        sm.finish_disconnect(disconnect, Ok(DisconnectResponse::default())).unwrap();

        let late = sm.finish_connect(connect, Ok(ConnectResponse::connected("0xA", None)));
        assert!(matches!(late, Err(ConnectorError::Cancelled)));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn check_resyncs_both_directions() {
        let sm = sm();
        let t = sm.begin_check().unwrap();
        assert!(matches!(sm.begin_connect(), Err(ConnectorError::AlreadyInProgress)));
        let out = sm.finish_check(t, Ok(ConnectResponse::connected("0xB", None))).unwrap();
        assert_eq!(out, CheckOutcome { state: ConnectionState::Connected, session_lost: false });
        assert_eq!(sm.account().unwrap().address.as_str(), "0xB");

        let t = sm.begin_check().unwrap();
        let out = sm.finish_check(t, Ok(ConnectResponse::disconnected())).unwrap();
        assert_eq!(out, CheckOutcome { state: ConnectionState::Disconnected, session_lost: true });
    }

    #[test]
    fn failed_check_keeps_state() {
        let sm = sm();
        connect_ok(&sm);
        let t = sm.begin_check().unwrap();
        let err = sm
            .finish_check(t, Err(ConnectorError::TransportUnavailable("x".into())))
            .unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert!(sm.begin_check().is_ok());
    }

    #[test]
    fn force_disconnect_invalidates_in_flight() {
        let sm = sm();
        connect_ok(&sm);
        let t = sm.begin_check().unwrap();
        assert!(sm.force_disconnect());
        assert!(matches!(
            sm.finish_check(t, Ok(ConnectResponse::connected("0xA", None))),
            Err(ConnectorError::Cancelled)
        ));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.begin_connect().is_ok());
    }

    #[test]
    fn invalidated_transition_keeps_request_error() {
        let sm = sm();
        let t = sm.begin_connect().unwrap();
        assert!(!sm.force_disconnect());
        let err = sm
            .finish_connect(t, Err(ConnectorError::TransportUnavailable("closed".into())))
            .unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn unacknowledged_disconnect_still_disconnects() {
        let sm = sm();
        connect_ok(&sm);
        let t = sm.begin_disconnect().unwrap();
        let err = sm
            .finish_disconnect(
                t,
                Err(ConnectorError::Timeout {
                    method: everlink_core::RequestMethod::Disconnect,
                    ms: 100,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { .. }));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.account().is_none());
    }
}
