//! Build status state machine values.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Status of a build.
///
/// `Pending -> Started -> {Succeeded, Failed, Errored}`; a tracker that
/// notices an abort finishes the build with `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Aborted,
    Succeeded,
    Failed,
    Errored,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
        }
    }

    /// Whether a build with this status can no longer receive events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Started)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "aborted" => Ok(BuildStatus::Aborted),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Started,
            BuildStatus::Aborted,
            BuildStatus::Succeeded,
            BuildStatus::Failed,
            BuildStatus::Errored,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Started.is_terminal());
        assert!(BuildStatus::Succeeded.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Errored.is_terminal());
        assert!(BuildStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_unknown_status() {
        assert!(matches!(
            "paused".parse::<BuildStatus>(),
            Err(Error::UnknownStatus(s)) if s == "paused"
        ));
    }
}
