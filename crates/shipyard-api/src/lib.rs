//! HTTP and WebSocket surfaces for Shipyard.
//!
//! Each role of `shipyard-server` exposes a small router:
//! - orchestrator: build queries and the development submission endpoint
//! - notifier: the live `/ws` feed
//! - builder: health only

pub mod error;
pub mod routes;
pub mod server;
pub mod state;
pub mod ws;

pub use state::{NotifierState, OrchestratorState};
