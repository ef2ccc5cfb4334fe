//! Build lifecycle.
//!
//! A build is created `pending`, moves to `started` exactly once and ends in
//! a terminal status. Every transition commits together with the event it
//! produces; the matching signal is sent only after the commit, and a failure
//! to send it never undoes the transition.

use async_trait::async_trait;
use buildlog_config::{EventsConfig, NotifierConfig};
use buildlog_core::channel::{BUILD_TRACKER_CHANNEL, build_abort_channel, build_events_channel};
use buildlog_core::{BuildId, BuildStatus, EncodedEvent, EventId};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::DbResult;
use crate::bus::NotificationBus;
use crate::check_build::CheckBuildFactory;
use crate::event_source::EventSource;
use crate::lock::{Lock, LockFactory, LockId};
use crate::notifier::{ConditionNotifier, Notifier};
use crate::repo::{BuildRecord, BuildRepo, BuildScope};

/// What every build needs to reach storage and the other processes.
#[derive(Clone)]
pub(crate) struct BuildContext {
    pub(crate) repo: Arc<dyn BuildRepo>,
    pub(crate) bus: Arc<NotificationBus>,
    pub(crate) locks: Arc<dyn LockFactory>,
    pub(crate) notifier: NotifierConfig,
    pub(crate) events: EventsConfig,
}

impl BuildContext {
    /// Signal a committed change. Failures are only logged: the change
    /// stands, and waiters fall back to polling.
    pub(crate) async fn notify(&self, build_id: BuildId, channel: &str) {
        if let Err(e) = self.bus.notify(channel).await {
            warn!(
                build_id = %build_id,
                channel = %channel,
                error = %e,
                "Failed to notify after commit"
            );
        }
    }
}

/// Operations shared by stored builds and in-memory check builds.
#[async_trait]
pub trait Build: Send + Sync {
    fn id(&self) -> BuildId;

    fn name(&self) -> String;

    fn status(&self) -> BuildStatus;

    /// Append an event to the build's log.
    async fn save_event(&self, event: &EncodedEvent) -> DbResult<()>;

    /// Move the build to a terminal status.
    async fn finish(&self, status: BuildStatus) -> DbResult<()>;

    /// Tail the build's events starting at `from`.
    async fn events(&self, from: EventId) -> DbResult<EventSource>;

    /// Fires once the build has been marked as aborted.
    async fn abort_notifier(&self) -> DbResult<Box<dyn Notifier>>;

    /// Take the lock that makes this process the build's only tracker.
    /// `None` if another tracker holds it.
    async fn acquire_tracking_lock(&self) -> DbResult<Option<Box<dyn Lock>>>;
}

/// Creates and loads builds.
#[derive(Clone)]
pub struct BuildFactory {
    ctx: BuildContext,
    check_builds: CheckBuildFactory,
}

impl BuildFactory {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        bus: Arc<NotificationBus>,
        locks: Arc<dyn LockFactory>,
        notifier: NotifierConfig,
        events: EventsConfig,
    ) -> Self {
        let ctx = BuildContext {
            repo,
            bus,
            locks,
            notifier,
            events,
        };
        Self {
            check_builds: CheckBuildFactory::new(ctx.clone()),
            ctx,
        }
    }

    /// Create a pending build with an empty log.
    pub async fn create_build(&self, scope: BuildScope, name: &str) -> DbResult<StoredBuild> {
        let record = self.ctx.repo.create(&scope, name).await?;
        debug!(build_id = %record.id, name = %record.name, "Created build");
        Ok(StoredBuild::new(self.ctx.clone(), record))
    }

    /// Load a build; `None` if it does not exist.
    pub async fn build(&self, id: BuildId) -> DbResult<Option<StoredBuild>> {
        let record = self.ctx.repo.get(id).await?;
        Ok(record.map(|record| StoredBuild::new(self.ctx.clone(), record)))
    }

    pub fn check_builds(&self) -> &CheckBuildFactory {
        &self.check_builds
    }

    pub fn repo(&self) -> &Arc<dyn BuildRepo> {
        &self.ctx.repo
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.ctx.bus
    }

    /// Resolves once the listen transport has given up reconnecting. From
    /// then on no build signal reaches this process; callers are expected to
    /// shut down.
    pub async fn transport_failed(&self) {
        self.ctx.bus.failed().await
    }

    /// Shut down the notification transport.
    pub async fn close(&self) {
        self.ctx.bus.close().await;
    }
}

/// A build backed by a database row.
pub struct StoredBuild {
    ctx: BuildContext,
    id: BuildId,
    scope: BuildScope,
    record: Mutex<BuildRecord>,
}

impl StoredBuild {
    fn new(ctx: BuildContext, record: BuildRecord) -> Self {
        Self {
            ctx,
            id: record.id,
            scope: record.scope.clone(),
            record: Mutex::new(record),
        }
    }

    fn cached(&self) -> MutexGuard<'_, BuildRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The row as last read or written by this handle.
    pub fn record(&self) -> BuildRecord {
        self.cached().clone()
    }

    pub fn scope(&self) -> &BuildScope {
        &self.scope
    }

    /// Re-read the row. `false` if it no longer exists.
    pub async fn reload(&self) -> DbResult<bool> {
        match self.ctx.repo.get(self.id).await? {
            Some(record) => {
                *self.cached() = record;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Claim a pending build for `tracked_by`.
    ///
    /// Returns `false` when the build is no longer pending or has been
    /// aborted; exactly one of any number of concurrent callers gets `true`.
    pub async fn start(&self, tracked_by: &str) -> DbResult<bool> {
        let Some(record) = self.ctx.repo.start(self.id, tracked_by).await? else {
            return Ok(false);
        };
        *self.cached() = record;

        self.ctx
            .notify(self.id, &build_events_channel(self.id))
            .await;
        self.ctx.notify(self.id, BUILD_TRACKER_CHANNEL).await;
        Ok(true)
    }

    /// Flag the build as aborted and wake its tracker. The status is left
    /// alone: a pending build stays pending and can no longer start.
    pub async fn mark_as_aborted(&self) -> DbResult<()> {
        self.ctx.repo.mark_aborted(self.id).await?;
        self.cached().aborted = true;

        self.ctx
            .notify(self.id, &build_abort_channel(self.id))
            .await;
        Ok(())
    }

    pub async fn set_interceptible(&self, interceptible: bool) -> DbResult<()> {
        self.ctx
            .repo
            .set_interceptible(self.id, interceptible)
            .await?;
        self.cached().interceptible = interceptible;
        Ok(())
    }

    pub async fn interceptible(&self) -> DbResult<bool> {
        self.ctx.repo.interceptible(self.id).await
    }

    pub async fn set_drained(&self, drained: bool) -> DbResult<()> {
        self.ctx.repo.set_drained(self.id, drained).await?;
        self.cached().drained = drained;
        Ok(())
    }

    /// Remove the build and its log. Tailers end with
    /// [`DbError::BuildDisappeared`](crate::DbError::BuildDisappeared).
    pub async fn delete(&self) -> DbResult<()> {
        self.ctx.repo.delete(self.id).await?;
        self.ctx
            .notify(self.id, &build_events_channel(self.id))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Build for StoredBuild {
    fn id(&self) -> BuildId {
        self.id
    }

    fn name(&self) -> String {
        self.cached().name.clone()
    }

    fn status(&self) -> BuildStatus {
        self.cached().status
    }

    async fn save_event(&self, event: &EncodedEvent) -> DbResult<()> {
        self.ctx
            .repo
            .save_event(self.id, &self.scope, event)
            .await?;
        self.ctx
            .notify(self.id, &build_events_channel(self.id))
            .await;
        Ok(())
    }

    async fn finish(&self, status: BuildStatus) -> DbResult<()> {
        let record = self.ctx.repo.finish(self.id, &self.scope, status).await?;
        *self.cached() = record;

        self.ctx
            .notify(self.id, &build_events_channel(self.id))
            .await;
        Ok(())
    }

    async fn events(&self, from: EventId) -> DbResult<EventSource> {
        EventSource::open(&self.ctx, self.id, from).await
    }

    async fn abort_notifier(&self) -> DbResult<Box<dyn Notifier>> {
        let repo = self.ctx.repo.clone();
        let id = self.id;
        let notifier = ConditionNotifier::new(
            self.ctx.bus.clone(),
            &build_abort_channel(id),
            move || {
                let repo = repo.clone();
                async move { repo.is_aborted(id).await }
            },
            self.ctx.notifier.retry_interval,
        )
        .await?;
        Ok(Box::new(notifier))
    }

    async fn acquire_tracking_lock(&self) -> DbResult<Option<Box<dyn Lock>>> {
        self.ctx.locks.acquire(LockId::BuildTracking(self.id)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::DbError;
    use crate::memory::MemoryHub;
    use buildlog_config::SystemConfig;
    use buildlog_core::{Event, Origin};
    use std::time::Duration;
    use tokio::time::timeout;

    pub(crate) fn test_system_config() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.listener = crate::listener::tests::test_config(32);
        config.notifier.retry_interval = Duration::from_millis(50);
        // Long enough that tests only pass when signals get through.
        config.events.poll_interval = Duration::from_secs(30);
        config
    }

    pub(crate) async fn memory_factory() -> (BuildFactory, MemoryHub) {
        crate::connect_in_memory(&test_system_config())
            .await
            .unwrap()
    }

    pub(crate) async fn memory_factory_with(events: EventsConfig) -> (BuildFactory, MemoryHub) {
        let mut config = test_system_config();
        config.events = events;
        crate::connect_in_memory(&config).await.unwrap()
    }

    pub(crate) fn log(line: &str) -> EncodedEvent {
        Event::log(
            Origin {
                id: "step".to_string(),
                source: "stdout".to_string(),
            },
            line,
        )
        .encode()
        .unwrap()
    }

    fn job_scope() -> BuildScope {
        BuildScope::Pipeline {
            team_id: 1,
            pipeline_id: 2,
            job_id: Some(3),
        }
    }

    async fn fires(notifier: &mut Box<dyn Notifier>) -> bool {
        matches!(
            timeout(Duration::from_millis(500), notifier.notified()).await,
            Ok(Ok(()))
        )
    }

    #[tokio::test]
    async fn test_build_lifecycle() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "42").await.unwrap();
        assert_eq!(build.status(), BuildStatus::Pending);
        assert_eq!(build.name(), "42");

        assert!(build.start("web-1").await.unwrap());
        assert_eq!(build.status(), BuildStatus::Started);
        assert_eq!(build.record().tracked_by.as_deref(), Some("web-1"));

        build.save_event(&log("hello")).await.unwrap();
        build.save_event(&log("world")).await.unwrap();
        build.finish(BuildStatus::Succeeded).await.unwrap();
        assert_eq!(build.status(), BuildStatus::Succeeded);
        assert!(build.record().completed);

        let mut source = build.events(0).await.unwrap();
        let mut decoded = Vec::new();
        loop {
            match source.next().await {
                Ok(event) => decoded.push((event.event_id, Event::decode(&event).unwrap())),
                Err(DbError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(decoded.len(), 4);
        assert!(matches!(
            decoded[0],
            (
                0,
                Event::Status {
                    status: BuildStatus::Started,
                    ..
                }
            )
        ));
        assert!(matches!(&decoded[1], (1, Event::Log { payload, .. }) if payload == "hello"));
        assert!(matches!(&decoded[2], (2, Event::Log { payload, .. }) if payload == "world"));
        assert!(matches!(
            decoded[3],
            (
                3,
                Event::Status {
                    status: BuildStatus::Succeeded,
                    ..
                }
            )
        ));

        assert!(matches!(
            build.save_event(&log("late")).await,
            Err(DbError::SequenceClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_only_one_concurrent_start_wins() {
        let (factory, _hub) = memory_factory().await;
        let created = factory.create_build(job_scope(), "1").await.unwrap();

        let mut attempts = Vec::new();
        for i in 0..8 {
            let build = factory.build(created.id()).await.unwrap().unwrap();
            attempts.push(tokio::spawn(async move {
                build.start(&format!("web-{i}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let page = factory.repo().events(created.id(), 0, 100).await.unwrap();
        assert_eq!(page.events.len(), 1);
    }

    #[tokio::test]
    async fn test_start_signals_tracker_channel() {
        let (factory, _hub) = memory_factory().await;
        let mut tracker = factory
            .bus()
            .listen(BUILD_TRACKER_CHANNEL, 1)
            .await
            .unwrap();
        let build = factory.create_build(job_scope(), "1").await.unwrap();

        assert!(build.start("web-1").await.unwrap());
        assert!(
            timeout(Duration::from_secs(5), tracker.recv())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_aborted_pending_build_never_starts() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();

        build.mark_as_aborted().await.unwrap();
        assert!(!build.start("web-1").await.unwrap());

        assert!(build.reload().await.unwrap());
        assert_eq!(build.status(), BuildStatus::Pending);
        assert!(build.record().aborted);
    }

    #[tokio::test]
    async fn test_abort_notifier_fires_on_abort() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();
        assert!(build.start("web-1").await.unwrap());

        let mut notifier = build.abort_notifier().await.unwrap();
        assert!(!fires(&mut notifier).await);

        let other_handle = factory.build(build.id()).await.unwrap().unwrap();
        other_handle.mark_as_aborted().await.unwrap();

        assert!(fires(&mut notifier).await);
        notifier.close().await.unwrap();

        // The tracker then finishes it.
        build.finish(BuildStatus::Aborted).await.unwrap();
        assert_eq!(build.status(), BuildStatus::Aborted);
    }

    #[tokio::test]
    async fn test_abort_notifier_fires_for_already_aborted_build() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();
        build.mark_as_aborted().await.unwrap();

        let mut notifier = build.abort_notifier().await.unwrap();
        assert!(fires(&mut notifier).await);
        notifier.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_rejects_non_terminal_status() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();

        assert!(matches!(
            build.finish(BuildStatus::Pending).await,
            Err(DbError::InvalidTransition(_))
        ));
        assert_eq!(build.status(), BuildStatus::Pending);
    }

    #[tokio::test]
    async fn test_transitions_after_delete_disappear() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();
        let id = build.id();
        build.delete().await.unwrap();

        assert!(matches!(
            build.start("web-1").await,
            Err(DbError::BuildDisappeared(b)) if b == id
        ));
        assert!(matches!(
            build.finish(BuildStatus::Failed).await,
            Err(DbError::BuildDisappeared(_))
        ));
        assert!(matches!(
            build.mark_as_aborted().await,
            Err(DbError::BuildDisappeared(_))
        ));
        assert!(!build.reload().await.unwrap());
        assert!(factory.build(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flags() {
        let (factory, _hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();

        assert!(build.interceptible().await.unwrap());
        build.set_interceptible(false).await.unwrap();
        assert!(!build.interceptible().await.unwrap());

        build.set_drained(true).await.unwrap();
        assert!(build.reload().await.unwrap());
        assert!(build.record().drained);
    }

    #[tokio::test]
    async fn test_tracking_lock_is_exclusive() {
        let (factory, _hub) = memory_factory().await;
        let created = factory.create_build(job_scope(), "1").await.unwrap();

        let mut attempts = Vec::new();
        for _ in 0..8 {
            let build = factory.build(created.id()).await.unwrap().unwrap();
            attempts.push(tokio::spawn(async move {
                build.acquire_tracking_lock().await.unwrap()
            }));
        }

        // Losers' results are dropped at once; the winner keeps its lock.
        let mut held = Vec::new();
        for attempt in attempts {
            if let Some(lock) = attempt.await.unwrap() {
                held.push(lock);
            }
        }
        assert_eq!(held.len(), 1);
        assert!(created.acquire_tracking_lock().await.unwrap().is_none());

        let mut lock = held.pop().unwrap();
        lock.release().await.unwrap();
        assert!(created.acquire_tracking_lock().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transport_give_up_reaches_callers() {
        let mut config = test_system_config();
        config.listener.give_up_after = Duration::from_millis(30);
        let (factory, hub) = crate::connect_in_memory(&config).await.unwrap();
        let build = factory.create_build(job_scope(), "1").await.unwrap();
        assert!(build.start("web-1").await.unwrap());

        let mut abort = build.abort_notifier().await.unwrap();
        let mut source = build.events(0).await.unwrap();
        assert_eq!(source.next().await.unwrap().event_id, 0);

        hub.set_reachable(false);
        hub.disconnect_all();

        timeout(Duration::from_secs(5), factory.transport_failed())
            .await
            .expect("factory never reported the dead transport");

        let notified = timeout(Duration::from_secs(5), abort.notified())
            .await
            .expect("abort notifier went deaf");
        assert!(matches!(notified, Err(DbError::Listen(_))));

        let next = timeout(Duration::from_secs(5), source.next())
            .await
            .expect("tail went deaf");
        assert!(matches!(next, Err(DbError::Listen(_))));
    }

    #[tokio::test]
    async fn test_tail_survives_listen_reconnect() {
        let (factory, hub) = memory_factory().await;
        let build = factory.create_build(job_scope(), "1").await.unwrap();
        assert!(build.start("web-1").await.unwrap());

        let mut source = build.events(0).await.unwrap();
        assert_eq!(source.next().await.unwrap().event_id, 0);

        let tail = tokio::spawn(async move {
            timeout(Duration::from_secs(5), source.next())
                .await
                .expect("tail never woke up")
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.disconnect_all();
        // Wait for the transport to come back and listen again.
        timeout(Duration::from_secs(5), async {
            while hub.connections() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        build.save_event(&log("after reconnect")).await.unwrap();
        assert_eq!(tail.await.unwrap().unwrap().event_id, 1);

        // Signals keep flowing on the new connection.
        let mut source = build.events(2).await.unwrap();
        let next = tokio::spawn(async move {
            timeout(Duration::from_secs(5), source.next())
                .await
                .expect("tail never woke up")
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        build.save_event(&log("later")).await.unwrap();
        assert_eq!(next.await.unwrap().unwrap().event_id, 2);
    }
}
