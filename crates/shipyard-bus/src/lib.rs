//! Message bus client for the Shipyard build pipeline.
//!
//! Every component talks to the others only through this bus. Messages are
//! partitioned by key (always the build id), delivered at least once, and
//! ordered only among messages that share a key within one topic.
//!
//! Two backends implement [`MessageBus`]:
//! - [`InMemoryBus`] for tests and single-process deployments
//! - [`PgBus`] for multi-process deployments sharing PostgreSQL

pub mod backoff;
pub mod bus;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod subscriber;
pub mod topic;

pub use backoff::BackoffPolicy;
pub use bus::{Delivery, MessageBus, Subscription, partition_for, publish_json};
pub use error::{BusError, BusResult, HandlerError};
pub use memory::InMemoryBus;
pub use postgres::PgBus;
pub use subscriber::{MessageHandler, attach_with_backoff, subscribe};
pub use topic::Topic;
