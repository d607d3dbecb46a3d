//! Balance listeners.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

/// Receives balance updates for one subscription.
///
/// Calls for a single subscription never overlap and arrive in provider
/// order. An `Err` is logged and otherwise ignored.
#[async_trait]
pub trait BalanceListener: Send + Sync + 'static {
    async fn on_balance(&self, balance: String) -> anyhow::Result<()>;
}

struct SyncFn<F>(F);

#[async_trait]
impl<F> BalanceListener for SyncFn<F>
where
    F: Fn(String) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn on_balance(&self, balance: String) -> anyhow::Result<()> {
        (self.0)(balance)
    }
}

struct AsyncFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> BalanceListener for AsyncFn<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_balance(&self, balance: String) -> anyhow::Result<()> {
        (self.f)(balance).await
    }
}

/// Wrap a synchronous closure.
pub fn from_fn<F>(f: F) -> Arc<dyn BalanceListener>
where
    F: Fn(String) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(SyncFn(f))
}

/// Wrap a closure returning a future.
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn BalanceListener>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(AsyncFn {
        f,
        _fut: PhantomData,
    })
}
