//! Check builds that only reach the database when they have to.
//!
//! Periodic resource checks run constantly and almost always succeed
//! quietly. A [`CheckBuild`] keeps its events in memory and is written to
//! the database (promoted) only when somebody needs to see it: when a user
//! watches it through `on_check_build_start`, or when it finishes with
//! anything but success.

use async_trait::async_trait;
use buildlog_core::channel::build_events_channel;
use buildlog_core::{BuildId, BuildStatus, EncodedEvent, Event, EventId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::build::{Build, BuildContext};
use crate::event_source::EventSource;
use crate::lock::{CheckableKind, Lock, LockId};
use crate::notifier::{NoopNotifier, Notifier};
use crate::repo::BuildScope;
use crate::{DbError, DbResult};

/// Name every check build row is stored under.
pub const CHECK_BUILD_NAME: &str = "check";

/// The resource or resource type being checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkable {
    pub kind: CheckableKind,
    pub id: i64,
    pub name: String,
    /// Scope the build is stored under once promoted.
    pub scope: BuildScope,
}

/// Identity of a check build before it has a database id. Stable for the
/// build's whole life, so it can name containers and volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckBuildKey {
    pub pre_id: u64,
    pub created_at: DateTime<Utc>,
}

/// Hands out check builds with process-local pre-ids.
#[derive(Clone)]
pub struct CheckBuildFactory {
    ctx: BuildContext,
    pre_ids: Arc<AtomicU64>,
}

impl CheckBuildFactory {
    pub(crate) fn new(ctx: BuildContext) -> Self {
        Self {
            ctx,
            pre_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A running check build for `checkable` executing plan `plan_id`.
    /// Nothing is written to the database.
    pub fn create(&self, checkable: Checkable, plan_id: i64) -> DbResult<CheckBuild> {
        let pre_id = self.pre_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Event::status(BuildStatus::Started).encode()?;

        Ok(CheckBuild {
            ctx: self.ctx.clone(),
            checkable,
            plan_id,
            key: CheckBuildKey {
                pre_id,
                created_at: Utc::now(),
            },
            id: AtomicI64::new(BuildId::UNMATERIALIZED.get()),
            status: Mutex::new(BuildStatus::Started),
            state: AsyncMutex::new(CheckState {
                promoted: false,
                buffered: vec![started],
            }),
        })
    }
}

struct CheckState {
    promoted: bool,
    /// Events saved before promotion, in order.
    buffered: Vec<EncodedEvent>,
}

pub struct CheckBuild {
    ctx: BuildContext,
    checkable: Checkable,
    plan_id: i64,
    key: CheckBuildKey,
    id: AtomicI64,
    status: Mutex<BuildStatus>,
    /// Held across promotion so saves and finishes queue behind it.
    state: AsyncMutex<CheckState>,
}

impl CheckBuild {
    pub fn key(&self) -> CheckBuildKey {
        self.key
    }

    /// Identifies the build's run state before it has an id.
    pub fn run_state_id(&self) -> String {
        format!("in-memory-check-build:{}", self.key.pre_id)
    }

    pub fn checkable(&self) -> &Checkable {
        &self.checkable
    }

    pub fn plan_id(&self) -> i64 {
        self.plan_id
    }

    pub fn is_promoted(&self) -> bool {
        BuildId::new(self.id.load(Ordering::Acquire)).is_materialized()
    }

    fn set_status(&self, status: BuildStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Somebody started watching: write the build and everything it has
    /// produced so far. Idempotent while the check runs.
    pub async fn on_check_build_start(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if self.status().is_terminal() {
            return Err(DbError::InvalidTransition(
                "check build already finished".to_string(),
            ));
        }
        if state.promoted {
            return Ok(());
        }

        let id = self.promote(&mut state).await?;
        self.ctx.notify(id, &build_events_channel(id)).await;
        Ok(())
    }

    async fn promote(&self, state: &mut CheckState) -> DbResult<BuildId> {
        let record = self
            .ctx
            .repo
            .create_started_check(&self.checkable.scope, CHECK_BUILD_NAME, &state.buffered)
            .await?;

        state.buffered.clear();
        state.promoted = true;
        self.id.store(record.id.get(), Ordering::Release);

        info!(
            pre_id = self.key.pre_id,
            build_id = %record.id,
            checkable = %self.checkable.name,
            "Promoted in-memory check build"
        );
        Ok(record.id)
    }

    pub async fn start(&self) -> DbResult<bool> {
        Err(DbError::Unsupported("start"))
    }

    pub async fn mark_as_aborted(&self) -> DbResult<()> {
        Err(DbError::Unsupported("mark_as_aborted"))
    }

    pub async fn set_interceptible(&self, _interceptible: bool) -> DbResult<()> {
        Err(DbError::Unsupported("set_interceptible"))
    }

    pub async fn interceptible(&self) -> DbResult<bool> {
        Err(DbError::Unsupported("interceptible"))
    }
}

#[async_trait]
impl Build for CheckBuild {
    /// [`BuildId::UNMATERIALIZED`] until promoted.
    fn id(&self) -> BuildId {
        BuildId::new(self.id.load(Ordering::Acquire))
    }

    fn name(&self) -> String {
        CHECK_BUILD_NAME.to_string()
    }

    fn status(&self) -> BuildStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn save_event(&self, event: &EncodedEvent) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if self.status().is_terminal() {
            return Err(DbError::InvalidTransition(
                "check build already finished".to_string(),
            ));
        }

        if !state.promoted {
            state.buffered.push(event.clone());
            return Ok(());
        }

        let id = self.id();
        self.ctx
            .repo
            .save_event(id, &self.checkable.scope, event)
            .await?;
        drop(state);

        self.ctx.notify(id, &build_events_channel(id)).await;
        Ok(())
    }

    async fn finish(&self, status: BuildStatus) -> DbResult<()> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "cannot finish check build with status {}",
                status
            )));
        }

        let mut state = self.state.lock().await;
        if self.status().is_terminal() {
            return Err(DbError::InvalidTransition(
                "check build already finished".to_string(),
            ));
        }

        if !state.promoted {
            if status == BuildStatus::Succeeded {
                // Nobody watched and nothing went wrong: leave no trace.
                state.buffered.clear();
                self.set_status(status);
                return Ok(());
            }
            self.promote(&mut state).await?;
        }

        let id = self.id();
        self.ctx
            .repo
            .finish(id, &self.checkable.scope, status)
            .await?;
        self.set_status(status);
        drop(state);

        self.ctx.notify(id, &build_events_channel(id)).await;
        Ok(())
    }

    async fn events(&self, from: EventId) -> DbResult<EventSource> {
        let id = self.id();
        if !id.is_materialized() {
            return Err(DbError::NoEvents);
        }
        EventSource::open(&self.ctx, id, from).await
    }

    /// Aborting an unpromoted check build from another process is not
    /// possible, so there is nothing to wait for.
    async fn abort_notifier(&self) -> DbResult<Box<dyn Notifier>> {
        Ok(Box::new(NoopNotifier))
    }

    async fn acquire_tracking_lock(&self) -> DbResult<Option<Box<dyn Lock>>> {
        self.ctx
            .locks
            .acquire(LockId::CheckBuildTracking {
                kind: self.checkable.kind,
                id: self.checkable.id,
            })
            .await
    }
}
