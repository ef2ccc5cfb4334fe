//! Condition notifiers: "re-check now" pulses for a single consumer.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bus::{NotificationBus, Subscription, SubscriptionKey};
use crate::{DbError, DbResult};

/// Something a consumer can wait on until it should look again.
#[async_trait]
pub trait Notifier: Send {
    /// Resolves once the watched condition may have become true.
    ///
    /// Fails when the signals behind the notifier are gone for good, e.g.
    /// the listen transport gave up reconnecting.
    async fn notified(&mut self) -> DbResult<()>;

    async fn close(&mut self) -> DbResult<()>;
}

/// Never fires.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notified(&mut self) -> DbResult<()> {
        std::future::pending().await
    }

    async fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}

/// Evaluates a condition initially and after every signal on a channel, and
/// pulses whenever it holds.
///
/// Pulses are coalesced into a single pending slot, so the evaluating side
/// never blocks on a slow consumer.
pub struct ConditionNotifier {
    bus: Arc<NotificationBus>,
    key: Option<SubscriptionKey>,
    pulses: mpsc::Receiver<()>,
    task: Option<JoinHandle<()>>,
}

impl ConditionNotifier {
    pub async fn new<F, Fut>(
        bus: Arc<NotificationBus>,
        channel: &str,
        condition: F,
        retry_interval: Duration,
    ) -> DbResult<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<bool>> + Send + 'static,
    {
        let subscription = bus.listen(channel, 1).await?;
        let key = subscription.key().clone();

        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(watch(subscription, condition, tx, retry_interval));

        Ok(Self {
            bus,
            key: Some(key),
            pulses: rx,
            task: Some(task),
        })
    }
}

#[async_trait]
impl Notifier for ConditionNotifier {
    async fn notified(&mut self) -> DbResult<()> {
        if self.pulses.recv().await.is_some() {
            return Ok(());
        }

        if self.key.is_none() {
            // Closed by the owner: never fire again.
            return std::future::pending().await;
        }
        Err(DbError::Listen(
            "notification bus closed while waiting".to_string(),
        ))
    }

    async fn close(&mut self) -> DbResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }

        match self.key.take() {
            Some(key) => self.bus.unlisten(&key).await,
            None => Ok(()),
        }
    }
}

impl Drop for ConditionNotifier {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let Some(key) = self.key.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let bus = self.bus.clone();
            runtime.spawn(async move {
                if let Err(e) = bus.unlisten(&key).await {
                    warn!(channel = %key.channel, error = %e, "Failed to unlisten dropped notifier");
                }
            });
        }
    }
}

async fn watch<F, Fut>(
    mut subscription: Subscription,
    condition: F,
    pulses: mpsc::Sender<()>,
    retry_interval: Duration,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = DbResult<bool>>,
{
    loop {
        match condition().await {
            Ok(ready) => {
                if ready {
                    // A full slot already tells the consumer to re-check.
                    let _ = pulses.try_send(());
                }

                if subscription.recv().await.is_none() {
                    return;
                }
            }
            Err(e) => {
                warn!(
                    channel = %subscription.key().channel,
                    error = %e,
                    "Failed to evaluate condition"
                );
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}
