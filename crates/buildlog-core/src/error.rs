//! Error types for domain type conversions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown build status: {0}")]
    UnknownStatus(String),

    #[error("unknown event type {event_type} (version {version})")]
    UnknownEvent { event_type: String, version: String },

    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
