//! Build events.
//!
//! A build's log is an ordered list of [`EventRecord`]s. The log itself never
//! looks inside `payload`; `type` and `version` tell a consumer how to read it.
//! [`Event`] covers the events the build lifecycle emits on its own.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{BuildId, BuildStatus, Error, EventId, Result};

/// One stored event, as delivered to tailers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub build_id: BuildId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub payload: serde_json::Value,
}

/// An event that has not been assigned a position yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub payload: serde_json::Value,
}

impl EncodedEvent {
    pub fn into_record(self, build_id: BuildId, event_id: EventId) -> EventRecord {
        EventRecord {
            event_id,
            build_id,
            event_type: self.event_type,
            version: self.version,
            payload: self.payload,
        }
    }
}

/// Where inside a build an event came from (a step of the plan).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    Status {
        status: BuildStatus,
        time: i64,
    },
    Log {
        origin: Origin,
        payload: String,
        time: i64,
    },
    Error {
        origin: Origin,
        message: String,
        time: i64,
    },
}

impl Event {
    /// Status event stamped with the current time.
    pub fn status(status: BuildStatus) -> Self {
        Event::Status {
            status,
            time: Utc::now().timestamp(),
        }
    }

    /// Log output stamped with the current time.
    pub fn log(origin: Origin, payload: impl Into<String>) -> Self {
        Event::Log {
            origin,
            payload: payload.into(),
            time: Utc::now().timestamp(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::Log { .. } => "log",
            Event::Error { .. } => "error",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            Event::Status { .. } => "1.0",
            Event::Log { .. } => "5.1",
            Event::Error { .. } => "4.1",
        }
    }

    pub fn encode(&self) -> Result<EncodedEvent> {
        Ok(EncodedEvent {
            event_type: self.event_type().to_string(),
            version: self.version().to_string(),
            payload: serde_json::to_value(self)?,
        })
    }

    pub fn decode(record: &EventRecord) -> Result<Self> {
        let event: Event = match (record.event_type.as_str(), record.version.as_str()) {
            ("status", "1.0") | ("log", "5.1") | ("error", "4.1") => {
                serde_json::from_value(record.payload.clone())?
            }
            _ => {
                return Err(Error::UnknownEvent {
                    event_type: record.event_type.clone(),
                    version: record.version.clone(),
                });
            }
        };

        // Untagged decoding picks the first shape that fits; make sure it
        // agrees with the declared type.
        if event.event_type() != record.event_type {
            return Err(Error::UnknownEvent {
                event_type: record.event_type.clone(),
                version: record.version.clone(),
            });
        }

        Ok(event)
    }
}
