//! Notification bus: many logical subscribers over one listen transport.
//!
//! Every subscriber gets its own bounded mailbox. Delivery never blocks: when
//! a mailbox is full the subscriber already has a signal pending, which is
//! all a "something changed, re-check" consumer needs.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::DbResult;
use crate::listener::{ListenTransport, Notification};

/// Sends a signal on a channel.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, channel: &str) -> DbResult<()>;
}

/// Sends `pg_notify` through the ordinary connection pool.
pub struct PgNotify {
    pool: PgPool,
}

impl PgNotify {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notify for PgNotify {
    async fn notify(&self, channel: &str) -> DbResult<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(channel)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Identifies one registration on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: String,
    id: u64,
}

/// A registered mailbox for one channel.
#[derive(Debug)]
pub struct Subscription {
    key: SubscriptionKey,
    rx: mpsc::Receiver<Notification>,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Next signal; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

type Listeners = HashMap<String, HashMap<u64, mpsc::Sender<Notification>>>;

pub struct NotificationBus {
    transport: ListenTransport,
    notifier: Arc<dyn Notify>,
    listeners: Arc<Mutex<Listeners>>,
    next_id: AtomicU64,
    dispatcher: JoinHandle<()>,
}

impl NotificationBus {
    pub fn new(transport: ListenTransport, notifier: Arc<dyn Notify>) -> DbResult<Self> {
        let incoming = transport.notifications()?;
        let listeners: Arc<Mutex<Listeners>> = Arc::default();
        let dispatcher = tokio::spawn(dispatch(incoming, listeners.clone()));

        Ok(Self {
            transport,
            notifier,
            listeners,
            next_id: AtomicU64::new(1),
            dispatcher,
        })
    }

    /// Broadcast a signal to every process listening on `channel`.
    pub async fn notify(&self, channel: &str) -> DbResult<()> {
        self.notifier.notify(channel).await
    }

    /// Register a mailbox of `capacity` signals for `channel`.
    pub async fn listen(&self, channel: &str, capacity: usize) -> DbResult<Subscription> {
        let mut listeners = self.listeners.lock().await;

        if !listeners.contains_key(channel) {
            self.transport.subscribe(channel).await?;
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        listeners
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);

        Ok(Subscription {
            key: SubscriptionKey {
                channel: channel.to_string(),
                id,
            },
            rx,
        })
    }

    /// Remove a mailbox. The last one on a channel stops listening on it.
    pub async fn unlisten(&self, key: &SubscriptionKey) -> DbResult<()> {
        let mut listeners = self.listeners.lock().await;

        let Some(mailboxes) = listeners.get_mut(&key.channel) else {
            return Ok(());
        };
        mailboxes.remove(&key.id);
        if !mailboxes.is_empty() {
            return Ok(());
        }

        listeners.remove(&key.channel);
        self.transport.unsubscribe(&key.channel).await
    }

    /// Resolves once the listen transport has given up reconnecting.
    pub async fn failed(&self) {
        self.transport.failed().await
    }

    pub async fn close(&self) {
        self.transport.close().await;
        self.dispatcher.abort();
    }
}

impl Drop for NotificationBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(mut incoming: mpsc::Receiver<Notification>, listeners: Arc<Mutex<Listeners>>) {
    while let Some(notification) = incoming.recv().await {
        let listeners = listeners.lock().await;

        if notification.healthy {
            if let Some(mailboxes) = listeners.get(&notification.channel) {
                for mailbox in mailboxes.values() {
                    let _ = mailbox.try_send(notification.clone());
                }
            }
        } else {
            debug!("Waking every listener after a lost connection");
            for mailbox in listeners.values().flat_map(|m| m.values()) {
                let _ = mailbox.try_send(notification.clone());
            }
        }
    }

    // Dropping the senders ends every subscription.
    let mut listeners = listeners.lock().await;
    warn!(
        channels = listeners.len(),
        "Notification stream ended, closing every mailbox"
    );
    listeners.clear();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::listener::tests::{FakeConnector, FakeHandle, test_config};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    pub(crate) struct RecordingNotify {
        pub(crate) sent: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notify for RecordingNotify {
        async fn notify(&self, channel: &str) -> DbResult<()> {
            self.sent.lock().unwrap().push(channel.to_string());
            Ok(())
        }
    }

    async fn bus() -> (NotificationBus, FakeHandle, Arc<RecordingNotify>) {
        let connector = FakeConnector::default();
        let conn = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();
        let notifier = Arc::new(RecordingNotify::default());
        let bus = NotificationBus::new(transport, notifier.clone()).unwrap();
        (bus, conn, notifier)
    }

    async fn recv(sub: &mut Subscription) -> Notification {
        timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("bus closed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_notify_uses_notifier() {
        let (bus, _conn, notifier) = bus().await;
        bus.notify("some-channel").await.unwrap();
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["some-channel"]);
    }

    #[tokio::test]
    async fn test_listens_once_per_channel() {
        let (bus, conn, _) = bus().await;

        let a = bus.listen("some-channel", 1).await.unwrap();
        let b = bus.listen("some-channel", 1).await.unwrap();
        assert_eq!(conn.statements(), vec!["LISTEN some-channel"]);

        bus.unlisten(a.key()).await.unwrap();
        assert_eq!(conn.statements(), vec!["LISTEN some-channel"]);

        bus.unlisten(b.key()).await.unwrap();
        assert_eq!(
            conn.statements(),
            vec!["LISTEN some-channel", "UNLISTEN some-channel"]
        );
    }

    #[tokio::test]
    async fn test_delivers_to_all_listeners_of_a_channel() {
        let (bus, conn, _) = bus().await;
        let mut a = bus.listen("some-channel", 1).await.unwrap();
        let mut b = bus.listen("some-channel", 1).await.unwrap();
        let mut other = bus.listen("some-other-channel", 1).await.unwrap();

        conn.send("some-channel");

        assert!(recv(&mut a).await.healthy);
        assert!(recv(&mut b).await.healthy);
        settle().await;
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unlistened_mailbox_no_longer_receives() {
        let (bus, conn, _) = bus().await;
        let mut a = bus.listen("some-channel", 1).await.unwrap();
        let mut b = bus.listen("some-channel", 1).await.unwrap();

        bus.unlisten(a.key()).await.unwrap();
        conn.send("some-channel");

        assert!(recv(&mut b).await.healthy);
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_wakes_every_listener() {
        let connector = FakeConnector::default();
        let first = connector.prepare();
        let _second = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();
        let bus = NotificationBus::new(transport, Arc::new(RecordingNotify::default())).unwrap();

        let mut a = bus.listen("some-channel", 1).await.unwrap();
        let mut b = bus.listen("some-other-channel", 1).await.unwrap();

        first.drop_connection();

        assert!(!recv(&mut a).await.healthy);
        assert!(!recv(&mut b).await.healthy);
    }

    #[tokio::test]
    async fn test_dead_transport_closes_every_mailbox() {
        let connector = FakeConnector::default();
        let conn = connector.prepare();
        let mut config = test_config(32);
        config.give_up_after = Duration::from_millis(30);
        let transport = ListenTransport::start(connector, config).await.unwrap();
        let bus = NotificationBus::new(transport, Arc::new(RecordingNotify::default())).unwrap();

        let mut a = bus.listen("some-channel", 1).await.unwrap();
        let mut b = bus.listen("some-other-channel", 1).await.unwrap();

        conn.drop_connection();
        timeout(Duration::from_secs(5), bus.failed())
            .await
            .expect("bus never reported failure");

        for sub in [&mut a, &mut b] {
            assert!(!recv(sub).await.healthy);
            let closed = timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("mailbox left open after the transport died");
            assert!(closed.is_none());
        }
        assert!(bus.listen("some-channel", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_small_mailbox_coalesces() {
        let (bus, conn, _) = bus().await;
        let mut a = bus.listen("some-channel", 1).await.unwrap();

        for _ in 0..100 {
            conn.send("some-channel");
        }
        settle().await;

        recv(&mut a).await;
        assert!(a.rx.try_recv().is_err());

        conn.send("some-channel");
        recv(&mut a).await;
    }

    #[tokio::test]
    async fn test_large_mailbox_queues_every_signal() {
        let (bus, conn, _) = bus().await;
        let mut a = bus.listen("some-channel", 100).await.unwrap();

        for _ in 0..100 {
            conn.send("some-channel");
        }
        for _ in 0..100 {
            recv(&mut a).await;
        }

        conn.send("some-channel");
        recv(&mut a).await;
    }
}
