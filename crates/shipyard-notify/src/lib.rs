//! Notification fan-out: pushes progress events to live observers.

pub mod frame;
pub mod handler;
pub mod hub;

pub use frame::Frame;
pub use handler::{CONSUMER_GROUP, NotifyHandler, SUBSCRIBED_TOPICS, run_consumer};
pub use hub::{NotificationHub, Subscription};
