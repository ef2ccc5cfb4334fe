//! Notification channel names.
//!
//! Channels are plain PostgreSQL `LISTEN`/`NOTIFY` identifiers, so names
//! only use lowercase letters, digits and underscores.

use crate::BuildId;

/// Notified whenever a build starts, so build trackers can pick it up.
pub const BUILD_TRACKER_CHANNEL: &str = "build_tracker";

const BUILD_EVENTS_PREFIX: &str = "build_events_";
const BUILD_ABORT_PREFIX: &str = "build_abort_";

/// Channel signalled after new events for a build are committed.
pub fn build_events_channel(id: BuildId) -> String {
    format!("{}{}", BUILD_EVENTS_PREFIX, id)
}

/// Channel signalled when a build is marked as aborted.
pub fn build_abort_channel(id: BuildId) -> String {
    format!("{}{}", BUILD_ABORT_PREFIX, id)
}
