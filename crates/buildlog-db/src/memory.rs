//! In-process storage and notification hub.
//!
//! [`MemoryBuildRepo`] and [`MemoryHub`] implement the same traits as the
//! PostgreSQL code, so a single node can run without a database and the
//! lifecycle can be exercised end to end in tests.

use async_trait::async_trait;
use buildlog_core::{BuildId, BuildStatus, EncodedEvent, Event, EventId, EventRecord};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::bus::Notify;
use crate::listener::{Connector, ListenConn, Notification};
use crate::repo::build::JobRecord;
use crate::repo::{BuildRecord, BuildRepo, BuildScope, EventPage};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Store {
    next_build_id: i64,
    builds: BTreeMap<BuildId, BuildRecord>,
    /// Next event id per build; absent once the sequence is closed.
    sequences: HashMap<BuildId, EventId>,
    events: HashMap<BuildId, Vec<EventRecord>>,
    jobs: HashMap<i64, JobRecord>,
}

impl Store {
    fn build(&self, id: BuildId) -> DbResult<&BuildRecord> {
        self.builds.get(&id).ok_or(DbError::BuildDisappeared(id))
    }

    fn build_mut(&mut self, id: BuildId) -> DbResult<&mut BuildRecord> {
        self.builds.get_mut(&id).ok_or(DbError::BuildDisappeared(id))
    }

    fn insert(&mut self, scope: &BuildScope, name: &str, started: bool) -> BuildRecord {
        self.next_build_id += 1;
        let id = BuildId::new(self.next_build_id);
        let now = Utc::now();

        let record = BuildRecord {
            id,
            name: name.to_string(),
            status: if started {
                BuildStatus::Started
            } else {
                BuildStatus::Pending
            },
            scope: scope.clone(),
            check: started,
            interceptible: true,
            drained: false,
            aborted: false,
            completed: false,
            tracked_by: None,
            create_time: now,
            start_time: started.then_some(now),
            end_time: None,
            reap_time: None,
        };

        self.builds.insert(id, record.clone());
        self.sequences.insert(id, 0);
        self.events.insert(id, Vec::new());
        if let Some(job_id) = scope.job_id() {
            self.jobs.entry(job_id).or_insert_with(|| JobRecord {
                id: job_id,
                ..Default::default()
            });
        }
        record
    }

    /// Next event id of a build that can still receive events.
    fn check_sequence(&self, id: BuildId) -> DbResult<EventId> {
        if !self.builds.contains_key(&id) {
            return Err(DbError::BuildDisappeared(id));
        }
        self.sequences
            .get(&id)
            .copied()
            .ok_or(DbError::SequenceClosed(id))
    }

    fn append(&mut self, id: BuildId, event: EncodedEvent) -> DbResult<EventId> {
        let next = self.check_sequence(id)?;
        self.sequences.insert(id, next + 1);
        self.events
            .entry(id)
            .or_default()
            .push(event.into_record(id, next));
        Ok(next)
    }

    fn update_next_build(&mut self, job_id: i64) {
        let next = self
            .builds
            .values()
            .filter(|b| b.scope.job_id() == Some(job_id) && !b.status.is_terminal())
            .map(|b| b.id.get())
            .min();
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.next_build_id = next;
        }
    }

    fn update_after_finish(&mut self, job_id: i64, build_id: BuildId, status: BuildStatus) {
        let latest = self
            .jobs
            .get(&job_id)
            .and_then(|job| job.latest_completed_build_id)
            .and_then(|latest| self.builds.get(&BuildId::new(latest)))
            .map(|b| (b.id.get(), b.status));

        let transition = match latest {
            Some((latest_id, latest_status)) => {
                build_id.get() >= latest_id && latest_status != status
            }
            None => true,
        };

        if let Some(job) = self.jobs.get_mut(&job_id) {
            if transition {
                job.transition_build_id = Some(build_id.get());
            }
            if job
                .latest_completed_build_id
                .is_none_or(|latest| latest < build_id.get())
            {
                job.latest_completed_build_id = Some(build_id.get());
            }
        }
        self.update_next_build(job_id);
    }
}

/// [`BuildRepo`] on a single mutex. Every operation checks everything it
/// needs before changing anything, which gives it the same all-or-nothing
/// behaviour as a database transaction.
#[derive(Default)]
pub struct MemoryBuildRepo {
    store: Mutex<Store>,
}

impl MemoryBuildRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BuildRepo for MemoryBuildRepo {
    async fn create(&self, scope: &BuildScope, name: &str) -> DbResult<BuildRecord> {
        let mut store = self.store();
        let record = store.insert(scope, name, false);
        if let Some(job_id) = scope.job_id() {
            store.update_next_build(job_id);
        }
        Ok(record)
    }

    async fn create_started_check(
        &self,
        scope: &BuildScope,
        name: &str,
        events: &[EncodedEvent],
    ) -> DbResult<BuildRecord> {
        let mut store = self.store();
        let record = store.insert(scope, name, true);
        for event in events {
            store.append(record.id, event.clone())?;
        }
        Ok(record)
    }

    async fn get(&self, id: BuildId) -> DbResult<Option<BuildRecord>> {
        Ok(self.store().builds.get(&id).cloned())
    }

    async fn start(&self, id: BuildId, tracked_by: &str) -> DbResult<Option<BuildRecord>> {
        let mut store = self.store();

        let build = store.build(id)?;
        if build.status != BuildStatus::Pending || build.aborted {
            return Ok(None);
        }
        store.check_sequence(id)?;

        let now = Utc::now();
        let event = Event::Status {
            status: BuildStatus::Started,
            time: now.timestamp(),
        }
        .encode()?;

        let build = store.build_mut(id)?;
        build.status = BuildStatus::Started;
        build.start_time = Some(now);
        build.tracked_by = Some(tracked_by.to_string());
        let record = build.clone();

        store.append(id, event)?;
        Ok(Some(record))
    }

    async fn save_event(
        &self,
        id: BuildId,
        _scope: &BuildScope,
        event: &EncodedEvent,
    ) -> DbResult<EventId> {
        self.store().append(id, event.clone())
    }

    async fn finish(
        &self,
        id: BuildId,
        _scope: &BuildScope,
        status: BuildStatus,
    ) -> DbResult<BuildRecord> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "cannot finish build {} with status {}",
                id, status
            )));
        }

        let mut store = self.store();
        store.check_sequence(id)?;

        let now = Utc::now();
        let event = Event::Status {
            status,
            time: now.timestamp(),
        }
        .encode()?;

        let build = store.build_mut(id)?;
        build.status = status;
        build.end_time = Some(now);
        build.completed = true;
        let record = build.clone();

        store.append(id, event)?;
        store.sequences.remove(&id);

        if let Some(job_id) = record.scope.job_id() {
            store.update_after_finish(job_id, id, status);
        }

        Ok(record)
    }

    async fn mark_aborted(&self, id: BuildId) -> DbResult<()> {
        self.store().build_mut(id)?.aborted = true;
        Ok(())
    }

    async fn is_aborted(&self, id: BuildId) -> DbResult<bool> {
        Ok(self.store().build(id)?.aborted)
    }

    async fn set_interceptible(&self, id: BuildId, interceptible: bool) -> DbResult<()> {
        self.store().build_mut(id)?.interceptible = interceptible;
        Ok(())
    }

    async fn interceptible(&self, id: BuildId) -> DbResult<bool> {
        Ok(self.store().build(id)?.interceptible)
    }

    async fn set_drained(&self, id: BuildId, drained: bool) -> DbResult<()> {
        self.store().build_mut(id)?.drained = drained;
        Ok(())
    }

    async fn delete(&self, id: BuildId) -> DbResult<()> {
        let mut store = self.store();
        let record = store
            .builds
            .remove(&id)
            .ok_or(DbError::BuildDisappeared(id))?;
        store.sequences.remove(&id);
        store.events.remove(&id);
        if let Some(job_id) = record.scope.job_id() {
            store.update_next_build(job_id);
        }
        Ok(())
    }

    async fn events(&self, id: BuildId, from: EventId, limit: u32) -> DbResult<EventPage> {
        let store = self.store();
        let completed = store.build(id)?.completed;

        let events = store
            .events
            .get(&id)
            .map(|events| {
                events
                    .iter()
                    .skip_while(|e| e.event_id < from)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(EventPage { events, completed })
    }

    async fn job(&self, job_id: i64) -> DbResult<Option<JobRecord>> {
        Ok(self.store().jobs.get(&job_id).cloned())
    }
}

type Inbox = mpsc::UnboundedSender<DbResult<Notification>>;

struct HubConn {
    channels: Arc<Mutex<HashSet<String>>>,
    inbox: Inbox,
}

/// In-process stand-in for LISTEN/NOTIFY.
///
/// Acts as the [`Connector`] of a listen transport and as the [`Notify`] of a
/// bus; every connection it hands out receives the signals for the channels
/// it listens on.
#[derive(Clone, Default)]
pub struct MemoryHub {
    conns: Arc<Mutex<Vec<HubConn>>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn conns(&self) -> MutexGuard<'_, Vec<HubConn>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Break every open connection, as a database restart would.
    pub fn disconnect_all(&self) {
        for conn in self.conns().drain(..) {
            let _ = conn
                .inbox
                .send(Err(DbError::Listen("connection closed by hub".to_string())));
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Number of connections currently attached.
    pub fn connections(&self) -> usize {
        self.conns().len()
    }
}

#[async_trait]
impl Connector for MemoryHub {
    async fn connect(&self) -> DbResult<Box<dyn ListenConn>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DbError::Listen("hub unreachable".to_string()));
        }

        let channels: Arc<Mutex<HashSet<String>>> = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns().push(HubConn {
            channels: channels.clone(),
            inbox: tx,
        });
        Ok(Box::new(MemoryListenConn {
            channels,
            inbox: rx,
        }))
    }
}

#[async_trait]
impl Notify for MemoryHub {
    async fn notify(&self, channel: &str) -> DbResult<()> {
        self.conns().retain(|conn| {
            let listening = conn
                .channels
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(channel);
            if !listening {
                return !conn.inbox.is_closed();
            }
            conn.inbox.send(Ok(Notification::new(channel, ""))).is_ok()
        });
        Ok(())
    }
}

struct MemoryListenConn {
    channels: Arc<Mutex<HashSet<String>>>,
    inbox: mpsc::UnboundedReceiver<DbResult<Notification>>,
}

impl MemoryListenConn {
    fn channels(&self) -> MutexGuard<'_, HashSet<String>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ListenConn for MemoryListenConn {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        self.channels().insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> DbResult<()> {
        self.channels().remove(channel);
        Ok(())
    }

    async fn wait(&mut self) -> DbResult<Notification> {
        match self.inbox.recv().await {
            Some(result) => result,
            None => Err(DbError::Listen("hub dropped the connection".to_string())),
        }
    }
}
