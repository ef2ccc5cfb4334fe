//! Build and event identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Position of an event in a build's log. Dense, starting at 0.
pub type EventId = i64;

/// Database identity of a build.
///
/// `0` is the sentinel for a build that has not been written to the
/// database yet (see in-memory check builds).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildId(i64);

impl BuildId {
    pub const UNMATERIALIZED: BuildId = BuildId(0);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// Whether a database row exists (or existed) for this build.
    pub fn is_materialized(&self) -> bool {
        self.0 != 0
    }
}

impl From<i64> for BuildId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<BuildId> for i64 {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}
