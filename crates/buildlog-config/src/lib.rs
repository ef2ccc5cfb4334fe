//! KDL configuration parsing for the build event log.
//!
//! This crate handles parsing of the system configuration (`buildlog.kdl`):
//! database connection, listen transport, condition notifier and event
//! tailing settings.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, EventsConfig, ListenerConfig, NotifierConfig, SystemConfig, parse_system_config,
};
