//! Tailing a build's events.

use buildlog_core::{BuildId, EventId, EventRecord, channel::build_events_channel};
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::build::BuildContext;
use crate::notifier::{ConditionNotifier, Notifier};
use crate::repo::BuildRepo;
use crate::{DbError, DbResult};

/// Reads a build's events in order, from any position, waiting for new ones
/// until the build completes.
///
/// Events are read in pages. Each page also reports whether the build had
/// completed before the events were read, so a completed build's stream ends
/// exactly after its last event. Between pages the source waits on the
/// build's events channel, falling back to a timer in case a signal is
/// missed.
pub struct EventSource {
    build_id: BuildId,
    repo: Arc<dyn BuildRepo>,
    notifier: Box<dyn Notifier>,
    cursor: EventId,
    buffered: VecDeque<EventRecord>,
    completed: bool,
    closed: bool,
    page_size: u32,
    poll_interval: Duration,
}

impl EventSource {
    pub(crate) async fn open(ctx: &BuildContext, build_id: BuildId, from: EventId) -> DbResult<Self> {
        let notifier = ConditionNotifier::new(
            ctx.bus.clone(),
            &build_events_channel(build_id),
            || futures::future::ready(Ok(true)),
            ctx.notifier.retry_interval,
        )
        .await?;

        Ok(Self {
            build_id,
            repo: ctx.repo.clone(),
            notifier: Box::new(notifier),
            cursor: from.max(0),
            buffered: VecDeque::new(),
            completed: false,
            closed: false,
            page_size: ctx.events.page_size.max(1),
            poll_interval: ctx.events.poll_interval,
        })
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    /// The next event.
    ///
    /// Fails with [`DbError::EndOfStream`] once every event of a completed
    /// build has been returned, and with [`DbError::StreamClosed`] after
    /// [`close`](Self::close). A listen transport that gave up reconnecting
    /// surfaces as [`DbError::Listen`]. Cancelling the returned future loses
    /// nothing.
    pub async fn next(&mut self) -> DbResult<EventRecord> {
        loop {
            if self.closed {
                return Err(DbError::StreamClosed);
            }
            if let Some(event) = self.buffered.pop_front() {
                return Ok(event);
            }
            if self.completed {
                return Err(DbError::EndOfStream);
            }

            let page = self
                .repo
                .events(self.build_id, self.cursor, self.page_size)
                .await?;

            // A full page may have more behind it even if the build is done.
            let full = page.events.len() >= self.page_size as usize;
            if let Some(last) = page.events.last() {
                self.cursor = last.event_id + 1;
            }
            self.completed = page.completed && !full;
            self.buffered.extend(page.events);

            if self.buffered.is_empty() && !self.completed {
                let poll_interval = self.poll_interval;
                tokio::select! {
                    notified = self.notifier.notified() => notified?,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    /// Stop tailing. Later calls to [`next`](Self::next) fail with
    /// [`DbError::StreamClosed`].
    pub async fn close(&mut self) -> DbResult<()> {
        self.closed = true;
        self.buffered.clear();
        self.notifier.close().await
    }

    /// The remaining events as a stream that ends with the build.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<EventRecord>> + Send {
        futures::stream::unfold(Some(self), |source| async move {
            let mut source = source?;
            match source.next().await {
                Ok(event) => Some((Ok(event), Some(source))),
                Err(DbError::EndOfStream) => {
                    let _ = source.close().await;
                    None
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
