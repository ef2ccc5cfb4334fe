//! Core domain types for the build event log.
//!
//! This crate contains:
//! - Build identifiers and statuses
//! - The event envelope stored in a build's log and the typed events
//! - Notification channel naming

pub mod channel;
pub mod error;
pub mod event;
pub mod id;
pub mod status;

pub use error::{Error, Result};
pub use event::{EncodedEvent, Event, EventRecord, Origin};
pub use id::{BuildId, EventId};
pub use status::BuildStatus;
