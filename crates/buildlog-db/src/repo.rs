//! Repository traits and implementations.

pub mod build;
pub mod events;
pub mod jobs;

pub use build::{BuildRecord, BuildRepo, BuildScope, EventPage, PgBuildRepo};
