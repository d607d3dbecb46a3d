//! everlink-client — talk to an injected wallet provider.
//!
//! # Features
//! - Request/response correlation with per-request timeouts
//! - Connection state machine with provider resync (`check_connect`)
//! - Balance subscriptions with per-subscription ordered delivery
//! - Idempotent removal, safe even before the provider confirms
//!
//! ```no_run
//! # async fn example() -> Result<(), everlink_core::ConnectorError> {
//! use everlink_client::{listener, SubscribeParams, WalletClient};
//! use everlink_core::{memory, ClientConfig};
//!
//! let (link, _provider) = memory::pair();
//! let client = WalletClient::new(link, ClientConfig::default())?;
//! let account = client.connect().await?;
//!
//! let on_balance = listener::from_fn(|balance| {
//!     println!("balance: {balance}");
//!     Ok(())
//! });
//! let sub = client
//!     .subscribe(SubscribeParams::balance(account.address.clone(), on_balance))?
//!     .await?;
//! client.remove(sub);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod listener;
pub mod subscriptions;

pub use client::{PendingSubscription, WalletClient};
pub use connection::{CheckOutcome, ConnectionState, ConnectionStateMachine};
pub use dispatcher::RequestDispatcher;
pub use listener::BalanceListener;
pub use subscriptions::{SubscribeKind, SubscribeParams, SubscriptionHandle, SubscriptionRegistry};
