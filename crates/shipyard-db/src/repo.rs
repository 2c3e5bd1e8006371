//! Store traits and implementations.

pub mod build;

pub use build::{BuildStore, CreateOutcome, PgBuildStore, PurgeStats};
