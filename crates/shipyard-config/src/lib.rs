//! Configuration for Shipyard services.
//!
//! Settings are resolved in three layers:
//! - built-in defaults
//! - an optional KDL file (`shipyard.kdl`)
//! - `SHIPYARD_*` environment variables

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    Backend, BackoffSettings, BuilderSettings, BusSettings, NotifierSettings,
    OrchestratorSettings, ShipyardConfig, StoreSettings, parse_config,
};
