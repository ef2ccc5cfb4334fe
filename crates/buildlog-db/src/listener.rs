//! Dedicated LISTEN connection shared by the whole process.
//!
//! A [`ListenTransport`] owns exactly one connection used for `LISTEN` /
//! `UNLISTEN` and for receiving asynchronous notifications. A background task
//! spends most of its time waiting on that connection. Callers that need to
//! run a statement ask for a turn: the task drops its in-flight wait, hands
//! the connection over, and takes it back once the caller's single statement
//! has run. The connection is never used from two places at once and the set
//! of listened channels travels with it, so no lock guards either.
//!
//! When the wait fails the task reconnects with capped exponential backoff
//! and re-issues `LISTEN` for every channel in the interest set. If no
//! connection can be made within the configured budget the transport is
//! dead: the notification queue closes and [`ListenTransport::failed`]
//! resolves, so the process can bring itself down.

use async_trait::async_trait;
use buildlog_config::ListenerConfig;
use futures::future::poll_fn;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{DbError, DbResult};

/// A signal received on a channel.
///
/// An unhealthy notification is not tied to a channel: it tells every waiter
/// that the connection dropped and signals may have been missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    pub healthy: bool,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            healthy: true,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            channel: String::new(),
            payload: String::new(),
            healthy: false,
        }
    }
}

/// A connection able to subscribe to channels and wait for notifications.
#[async_trait]
pub trait ListenConn: Send {
    async fn listen(&mut self, channel: &str) -> DbResult<()>;

    async fn unlisten(&mut self, channel: &str) -> DbResult<()>;

    /// Wait for the next notification.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a notification.
    async fn wait(&mut self) -> DbResult<Notification>;
}

/// Opens fresh listen connections, initially and after failures.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> DbResult<Box<dyn ListenConn>>;
}

/// Connects with `tokio_postgres`, outside of any pool.
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> DbResult<Box<dyn ListenConn>> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls).await?;
        Ok(Box::new(PgListenConn {
            client,
            connection,
            pending: VecDeque::new(),
        }))
    }
}

/// Raw connection whose message stream is polled by whoever holds it.
pub struct PgListenConn {
    client: Client,
    connection: Connection<Socket, NoTlsStream>,
    pending: VecDeque<Notification>,
}

impl PgListenConn {
    async fn execute(&mut self, statement: &str) -> DbResult<()> {
        let Self {
            client,
            connection,
            pending,
        } = self;

        let query = client.batch_execute(statement);
        tokio::pin!(query);

        // The connection only makes progress while polled, so keep reading
        // its messages until the statement completes. Notifications arriving
        // meanwhile are kept for the next wait.
        loop {
            tokio::select! {
                result = &mut query => return Ok(result?),
                message = poll_fn(|cx| connection.poll_message(cx)) => match message {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        pending.push_back(Notification::new(n.channel(), n.payload()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(DbError::Listen("listen connection closed".to_string())),
                },
            }
        }
    }
}

#[async_trait]
impl ListenConn for PgListenConn {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        self.execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
    }

    async fn unlisten(&mut self, channel: &str) -> DbResult<()> {
        self.execute(&format!("UNLISTEN {}", quote_ident(channel)))
            .await
    }

    async fn wait(&mut self) -> DbResult<Notification> {
        if let Some(notification) = self.pending.pop_front() {
            return Ok(notification);
        }

        loop {
            match poll_fn(|cx| self.connection.poll_message(cx)).await {
                Some(Ok(AsyncMessage::Notification(n))) => {
                    return Ok(Notification::new(n.channel(), n.payload()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(DbError::Listen("listen connection closed".to_string())),
            }
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Capped exponential delay between reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    pub first: Duration,
    pub max: Duration,
}

impl ReconnectBackoff {
    /// Delay after the given failed attempt (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.first.saturating_mul(factor).min(self.max)
    }
}

/// The connection together with the channels it listens on.
struct Session {
    conn: Box<dyn ListenConn>,
    channels: BTreeSet<String>,
}

/// Exclusive use of the session, handed to a caller by the owner task.
///
/// Dropping the turn hands the session back, including when the caller is
/// cancelled mid-statement.
struct Turn {
    session: Option<Session>,
    handback: Option<oneshot::Sender<Session>>,
}

impl Turn {
    fn session(&mut self) -> &mut Session {
        self.session
            .as_mut()
            .expect("turn holds the session until dropped")
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if let (Some(session), Some(handback)) = (self.session.take(), self.handback.take()) {
            let _ = handback.send(session);
        }
    }
}

/// Asking for a turn: carries the slot the turn is delivered to.
type TurnRequest = oneshot::Sender<Turn>;

/// Process-wide multiplexed LISTEN connection.
pub struct ListenTransport {
    turns: mpsc::Sender<TurnRequest>,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
    shutdown: CancellationToken,
    failed: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenTransport {
    /// Open the first connection and start the owner task.
    pub async fn start(connector: impl Connector, config: ListenerConfig) -> DbResult<Self> {
        let conn = connector.connect().await?;
        let session = Session {
            conn,
            channels: BTreeSet::new(),
        };

        let (turns_tx, turns_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let failed = CancellationToken::new();

        let owner = Owner {
            connector: Box::new(connector),
            backoff: ReconnectBackoff {
                first: config.min_reconnect,
                max: config.max_reconnect,
            },
            give_up_after: config.give_up_after,
            turns: turns_rx,
            out: out_tx,
            backlog: VecDeque::new(),
            shutdown: shutdown.clone(),
            failed: failed.clone(),
        };
        let task = tokio::spawn(owner.run(session));

        Ok(Self {
            turns: turns_tx,
            notifications: Mutex::new(Some(out_rx)),
            shutdown,
            failed,
            task: Mutex::new(Some(task)),
        })
    }

    /// Start listening on a channel. Subscribing twice is a no-op.
    pub async fn subscribe(&self, channel: &str) -> DbResult<()> {
        let mut turn = self.take_turn().await?;
        let session = turn.session();
        if session.channels.contains(channel) {
            return Ok(());
        }

        session.conn.listen(channel).await?;
        session.channels.insert(channel.to_string());
        debug!(channel = %channel, "Listening");
        Ok(())
    }

    /// Stop listening on a channel. Unknown channels are ignored.
    pub async fn unsubscribe(&self, channel: &str) -> DbResult<()> {
        let mut turn = self.take_turn().await?;
        let session = turn.session();
        if !session.channels.contains(channel) {
            return Ok(());
        }

        session.conn.unlisten(channel).await?;
        session.channels.remove(channel);
        debug!(channel = %channel, "Unlistened");
        Ok(())
    }

    /// Take the queue of incoming notifications. There is a single consumer.
    pub fn notifications(&self) -> DbResult<mpsc::Receiver<Notification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| DbError::Listen("notifications already taken".to_string()))
    }

    /// Resolves once the connection is lost for good.
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Stop the owner task and release the connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Listen transport task panicked");
                }
            }
        }
    }

    async fn take_turn(&self) -> DbResult<Turn> {
        let closed = || DbError::Listen("listen transport closed".to_string());

        let (tx, rx) = oneshot::channel();
        self.turns.send(tx).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }
}

impl Drop for ListenTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Owner {
    connector: Box<dyn Connector>,
    backoff: ReconnectBackoff,
    give_up_after: Duration,
    turns: mpsc::Receiver<TurnRequest>,
    out: mpsc::Sender<Notification>,
    backlog: VecDeque<Notification>,
    shutdown: CancellationToken,
    failed: CancellationToken,
}

impl Owner {
    async fn run(mut self, mut session: Session) {
        loop {
            let idle = self.backlog.is_empty();

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                request = self.turns.recv() => {
                    let Some(request) = request else { break };
                    // The wait branch has been dropped; the connection is free.
                    match grant(request, session).await {
                        Some(returned) => session = returned,
                        None => {
                            error!("Listen session was not handed back");
                            break;
                        }
                    }
                }
                permit = self.out.reserve(), if !idle => {
                    let Ok(permit) = permit else { break };
                    if let Some(notification) = self.backlog.pop_front() {
                        permit.send(notification);
                    }
                }
                received = session.conn.wait(), if idle => match received {
                    Ok(notification) => self.backlog.push_back(notification),
                    Err(e) => {
                        warn!(error = %e, "Listen connection lost");
                        self.backlog.push_back(Notification::disconnected());
                        // Wake waiters now rather than once the database is back.
                        flush_backlog(&mut self.backlog, &self.out);
                        match self.reconnect(session.channels).await {
                            Some(fresh) => session = fresh,
                            None => break,
                        }
                    }
                },
            }
        }

        debug!("Listen transport stopped");
    }

    async fn reconnect(&self, channels: BTreeSet<String>) -> Option<Session> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            match self.connector.connect().await {
                Ok(mut conn) => match resubscribe(conn.as_mut(), &channels).await {
                    Ok(()) => {
                        info!(
                            channels = channels.len(),
                            attempts = attempt + 1,
                            "Listen connection re-established"
                        );
                        return Some(Session { conn, channels });
                    }
                    Err(e) => warn!(attempt, error = %e, "Failed to resubscribe after reconnect"),
                },
                Err(e) => warn!(attempt, error = %e, "Failed to reconnect listen connection"),
            }

            let delay = self.backoff.next(attempt);
            if started.elapsed() + delay > self.give_up_after {
                error!(
                    elapsed = ?started.elapsed(),
                    give_up_after = ?self.give_up_after,
                    "Giving up on re-establishing the listen connection"
                );
                self.failed.cancel();
                return None;
            }
            attempt += 1;

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Move as much of the backlog into the queue as fits without waiting.
fn flush_backlog(backlog: &mut VecDeque<Notification>, out: &mpsc::Sender<Notification>) {
    while let Some(notification) = backlog.pop_front() {
        match out.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(notification)) => {
                backlog.push_front(notification);
                return;
            }
            Err(TrySendError::Closed(_)) => {
                backlog.clear();
                return;
            }
        }
    }
}

async fn grant(request: TurnRequest, session: Session) -> Option<Session> {
    let (handback_tx, handback_rx) = oneshot::channel();
    let turn = Turn {
        session: Some(session),
        handback: Some(handback_tx),
    };

    // Dropping the undelivered turn sends the session straight back.
    let _ = request.send(turn);
    handback_rx.await.ok()
}

async fn resubscribe(conn: &mut dyn ListenConn, channels: &BTreeSet<String>) -> DbResult<()> {
    for channel in channels {
        conn.listen(channel).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    /// Scripted connection: statements are recorded, notifications are fed
    /// through `incoming`, an `Err` there simulates a dropped connection.
    pub(crate) struct FakeConn {
        log: Log,
        incoming: mpsc::UnboundedReceiver<DbResult<Notification>>,
        fail_statements: bool,
    }

    #[async_trait]
    impl ListenConn for FakeConn {
        async fn listen(&mut self, channel: &str) -> DbResult<()> {
            if self.fail_statements {
                return Err(DbError::Listen("nope".to_string()));
            }
            self.log.lock().unwrap().push(format!("LISTEN {}", channel));
            Ok(())
        }

        async fn unlisten(&mut self, channel: &str) -> DbResult<()> {
            if self.fail_statements {
                return Err(DbError::Listen("nope".to_string()));
            }
            self.log.lock().unwrap().push(format!("UNLISTEN {}", channel));
            Ok(())
        }

        async fn wait(&mut self) -> DbResult<Notification> {
            match self.incoming.recv().await {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    pub(crate) struct FakeHandle {
        pub(crate) log: Log,
        pub(crate) incoming: mpsc::UnboundedSender<DbResult<Notification>>,
    }

    impl FakeHandle {
        pub(crate) fn send(&self, channel: &str) {
            self.incoming
                .send(Ok(Notification::new(channel, "")))
                .unwrap();
        }

        pub(crate) fn drop_connection(&self) {
            self.incoming
                .send(Err(DbError::Listen("connection reset".to_string())))
                .unwrap();
        }

        pub(crate) fn statements(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    /// Hands out prepared connections in order, then fails to connect.
    #[derive(Clone, Default)]
    pub(crate) struct FakeConnector {
        conns: Arc<Mutex<VecDeque<FakeConn>>>,
    }

    impl FakeConnector {
        pub(crate) fn prepare(&self) -> FakeHandle {
            self.prepare_with(false)
        }

        pub(crate) fn prepare_failing(&self) -> FakeHandle {
            self.prepare_with(true)
        }

        fn prepare_with(&self, fail_statements: bool) -> FakeHandle {
            let log: Log = Arc::default();
            let (tx, rx) = mpsc::unbounded_channel();
            self.conns.lock().unwrap().push_back(FakeConn {
                log: log.clone(),
                incoming: rx,
                fail_statements,
            });
            FakeHandle { log, incoming: tx }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> DbResult<Box<dyn ListenConn>> {
            match self.conns.lock().unwrap().pop_front() {
                Some(conn) => Ok(Box::new(conn)),
                None => Err(DbError::Listen("connection refused".to_string())),
            }
        }
    }

    pub(crate) fn test_config(queue_capacity: usize) -> ListenerConfig {
        ListenerConfig {
            queue_capacity,
            min_reconnect: Duration::from_millis(5),
            max_reconnect: Duration::from_millis(20),
            give_up_after: Duration::from_secs(10),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Notification>) -> Notification {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification queue closed")
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let connector = FakeConnector::default();
        let conn = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();

        transport.subscribe("some-channel").await.unwrap();
        transport.subscribe("some-channel").await.unwrap();
        transport.unsubscribe("some-channel").await.unwrap();
        transport.unsubscribe("some-channel").await.unwrap();
        transport.unsubscribe("never-subscribed").await.unwrap();

        assert_eq!(
            conn.statements(),
            vec!["LISTEN some-channel", "UNLISTEN some-channel"]
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_error_is_returned() {
        let connector = FakeConnector::default();
        let _conn = connector.prepare_failing();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();

        assert!(transport.subscribe("some-channel").await.is_err());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_delivers_notifications_in_order() {
        let connector = FakeConnector::default();
        let conn = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();
        let mut rx = transport.notifications().unwrap();
        assert!(transport.notifications().is_err());

        transport.subscribe("a").await.unwrap();
        conn.send("a");
        conn.incoming
            .send(Ok(Notification::new("a", "hello!")))
            .unwrap();

        assert_eq!(recv(&mut rx).await, Notification::new("a", ""));
        assert_eq!(recv(&mut rx).await, Notification::new("a", "hello!"));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_subscribe() {
        let connector = FakeConnector::default();
        let conn = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(1))
            .await
            .unwrap();
        let mut rx = transport.notifications().unwrap();

        for _ in 0..5 {
            conn.send("busy");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for channel in ["one", "two", "three"] {
            timeout(Duration::from_secs(5), transport.subscribe(channel))
                .await
                .expect("subscribe blocked behind a full queue")
                .unwrap();
        }

        // Nothing was dropped, only delayed.
        for _ in 0..5 {
            assert_eq!(recv(&mut rx).await.channel, "busy");
        }
        transport.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_every_channel() {
        let connector = FakeConnector::default();
        let first = connector.prepare();
        let second = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();
        let mut rx = transport.notifications().unwrap();

        transport.subscribe("build_events_1").await.unwrap();
        transport.subscribe("build_abort_1").await.unwrap();

        first.drop_connection();
        assert_eq!(recv(&mut rx).await, Notification::disconnected());

        second.send("build_events_1");
        assert_eq!(recv(&mut rx).await.channel, "build_events_1");
        second.send("build_abort_1");
        assert_eq!(recv(&mut rx).await.channel, "build_abort_1");

        let mut statements = second.statements();
        statements.sort();
        assert_eq!(
            statements,
            vec!["LISTEN build_abort_1", "LISTEN build_events_1"]
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_retries_until_connected() {
        let connector = FakeConnector::default();
        let first = connector.prepare();
        let transport = ListenTransport::start(connector.clone(), test_config(32))
            .await
            .unwrap();
        let mut rx = transport.notifications().unwrap();
        transport.subscribe("a").await.unwrap();

        first.drop_connection();
        assert!(!recv(&mut rx).await.healthy);

        // Let a few attempts fail before a connection becomes available.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = connector.prepare();

        timeout(Duration::from_secs(5), transport.subscribe("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.statements(), vec!["LISTEN a", "LISTEN b"]);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_transport() {
        let connector = FakeConnector::default();
        let _conn = connector.prepare();
        let transport = ListenTransport::start(connector, test_config(32))
            .await
            .unwrap();
        let mut rx = transport.notifications().unwrap();

        transport.close().await;

        assert!(transport.subscribe("a").await.is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let connector = FakeConnector::default();
        let first = connector.prepare();
        let mut config = test_config(32);
        config.give_up_after = Duration::from_millis(30);
        let transport = ListenTransport::start(connector, config).await.unwrap();
        let mut rx = transport.notifications().unwrap();
        transport.subscribe("a").await.unwrap();
        assert!(!transport.is_failed());

        first.drop_connection();

        timeout(Duration::from_secs(5), transport.failed())
            .await
            .expect("transport never reported failure");
        assert!(transport.is_failed());

        // Waiters were told, then the queue closed.
        assert!(!recv(&mut rx).await.healthy);
        assert!(rx.recv().await.is_none());
        assert!(transport.subscribe("b").await.is_err());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_flush_backlog_stops_at_full_queue() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut backlog: VecDeque<_> = ["a", "b", "c"]
            .into_iter()
            .map(|channel| Notification::new(channel, ""))
            .collect();

        flush_backlog(&mut backlog, &tx);

        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].channel, "c");
        assert_eq!(rx.recv().await.unwrap().channel, "a");
        assert_eq!(rx.recv().await.unwrap().channel, "b");

        drop(rx);
        flush_backlog(&mut backlog, &tx);
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_without_connection() {
        let result = ListenTransport::start(FakeConnector::default(), test_config(32)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = ReconnectBackoff {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.next(0), Duration::from_secs(1));
        assert_eq!(backoff.next(1), Duration::from_secs(2));
        assert_eq!(backoff.next(5), Duration::from_secs(32));
        assert_eq!(backoff.next(6), Duration::from_secs(60));
        assert_eq!(backoff.next(100), Duration::from_secs(60));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("build_events_1"), "\"build_events_1\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
