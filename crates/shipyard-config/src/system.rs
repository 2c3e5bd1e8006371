//! System configuration parsing.
//!
//! ```kdl
//! bus backend="postgres" url="postgres://shipyard@db/shipyard" partitions=8 retention-hours=24 {
//!     backoff initial-ms=2000 multiplier=1.5 max-attempts=15
//! }
//! store backend="postgres" retention-hours=24
//! orchestrator listen="0.0.0.0:8082" max-queued-age-secs=600
//! builder storage-url="http://storage:8084" step-timeout-secs=1800
//! notifier listen="0.0.0.0:8085" channel-capacity=256
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

/// Storage backend for the bus and the build store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Postgres,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "memory" => Ok(Backend::Memory),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(ConfigError::invalid(
                "backend",
                format!("unknown backend '{}', expected memory or postgres", other),
            )),
        }
    }
}

/// Top-level configuration shared by every Shipyard role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipyardConfig {
    pub bus: BusSettings,
    pub store: StoreSettings,
    pub orchestrator: OrchestratorSettings,
    pub builder: BuilderSettings,
    pub notifier: NotifierSettings,
}

/// Retry schedule for attaching to topics that do not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 2000,
            multiplier: 1.5,
            max_attempts: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    pub backend: Backend,
    pub url: Option<String>,
    /// Partitions created per topic.
    pub partitions: u32,
    pub subscribe_backoff: BackoffSettings,
    /// How often the postgres backend polls for new messages.
    pub poll_interval_ms: u64,
    /// How long a consumer holds a partition lease without renewing it.
    pub lease_secs: u64,
    /// Messages older than this are purged even if a group never consumed
    /// them.
    pub retention_hours: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            url: None,
            partitions: 8,
            subscribe_backoff: BackoffSettings::default(),
            poll_interval_ms: 250,
            lease_secs: 30,
            retention_hours: 24,
        }
    }
}

impl BusSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub backend: Backend,
    pub url: Option<String>,
    /// Records and logs expire this long after their last update.
    pub retention_hours: u64,
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            url: None,
            retention_hours: 24,
            max_connections: 10,
        }
    }
}

impl StoreSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub listen: SocketAddr,
    /// A build still queued after this long is reported as stalled.
    pub max_queued_age_secs: u64,
    pub stall_check_interval_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8082)),
            max_queued_age_secs: 600,
            stall_check_interval_secs: 60,
            purge_interval_secs: 300,
        }
    }
}

impl OrchestratorSettings {
    pub fn max_queued_age(&self) -> Duration {
        Duration::from_secs(self.max_queued_age_secs)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderSettings {
    pub listen: SocketAddr,
    /// Parent directory for per-job scratch directories.
    pub work_dir: PathBuf,
    /// Base URL of the artifact store.
    pub storage_url: String,
    /// Deadline for every external command.
    pub step_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub worker_id: String,
    /// Queried to skip redelivered jobs whose build already finished.
    pub orchestrator_url: Option<String>,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8083)),
            work_dir: std::env::temp_dir().join("shipyard-builds"),
            storage_url: "http://storage:8084".to_string(),
            step_timeout_secs: 1800,
            upload_timeout_secs: 30,
            worker_id: format!("builder-{}", host),
            orchestrator_url: None,
        }
    }
}

impl BuilderSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    pub listen: SocketAddr,
    /// Frames buffered per subscriber before new ones are dropped.
    pub channel_capacity: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8085)),
            channel_capacity: 256,
        }
    }
}

impl ShipyardConfig {
    /// Resolve configuration from defaults, an optional KDL file and the
    /// process environment, then validate it.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a KDL file on top of the defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_config(&text)
    }

    /// Apply environment overrides. `lookup` returns the value of a variable
    /// if it is set.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL");

        if let Some(v) = lookup("SHIPYARD_BUS_BACKEND") {
            self.bus.backend = v.parse()?;
        }
        if let Some(v) = lookup("SHIPYARD_BUS_URL").or_else(|| {
            self.bus.url.is_none().then(|| database_url.clone()).flatten()
        }) {
            self.bus.url = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_STORE_BACKEND") {
            self.store.backend = v.parse()?;
        }
        if let Some(v) = lookup("SHIPYARD_STORE_URL").or_else(|| {
            self.store.url.is_none().then(|| database_url.clone()).flatten()
        }) {
            self.store.url = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_RETENTION_HOURS") {
            self.store.retention_hours = parse_env_number("SHIPYARD_RETENTION_HOURS", &v)?;
        }
        if let Some(v) = lookup("SHIPYARD_STORAGE_URL") {
            self.builder.storage_url = v;
        }
        if let Some(v) = lookup("SHIPYARD_WORK_DIR") {
            self.builder.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SHIPYARD_WORKER_ID") {
            self.builder.worker_id = v;
        }
        if let Some(v) = lookup("SHIPYARD_ORCHESTRATOR_URL") {
            self.builder.orchestrator_url = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_STEP_TIMEOUT_SECS") {
            self.builder.step_timeout_secs = parse_env_number("SHIPYARD_STEP_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Reject settings no service can run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.bus.partitions == 0 {
            return Err(ConfigError::invalid("bus.partitions", "must be at least 1"));
        }
        let backoff = &self.bus.subscribe_backoff;
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "bus.backoff.multiplier",
                "must be at least 1.0",
            ));
        }
        if backoff.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "bus.backoff.max-attempts",
                "must be at least 1",
            ));
        }
        if self.bus.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("bus.poll-interval-ms", "must be at least 1"));
        }
        if self.bus.lease_secs == 0 {
            return Err(ConfigError::invalid("bus.lease-secs", "must be at least 1"));
        }
        if self.bus.retention_hours == 0 {
            return Err(ConfigError::invalid("bus.retention-hours", "must be at least 1"));
        }
        if self.bus.backend == Backend::Postgres && self.bus.url.is_none() {
            return Err(ConfigError::MissingField(
                "bus.url (required for the postgres backend)".to_string(),
            ));
        }
        if self.store.backend == Backend::Postgres && self.store.url.is_none() {
            return Err(ConfigError::MissingField(
                "store.url (required for the postgres backend)".to_string(),
            ));
        }
        if self.store.retention_hours == 0 {
            return Err(ConfigError::invalid("store.retention-hours", "must be at least 1"));
        }
        if self.orchestrator.stall_check_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.stall-check-interval-secs",
                "must be at least 1",
            ));
        }
        if self.orchestrator.purge_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.purge-interval-secs",
                "must be at least 1",
            ));
        }
        if self.builder.step_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "builder.step-timeout-secs",
                "must be at least 1",
            ));
        }
        if self.notifier.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "notifier.channel-capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_env_number<T: FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(name, format!("expected a number, got '{}'", value)))
}

/// Parse configuration from KDL text, starting from the defaults.
pub fn parse_config(kdl: &str) -> ConfigResult<ShipyardConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ShipyardConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "bus" => parse_bus(node, &mut config.bus)?,
            "store" => parse_store(node, &mut config.store)?,
            "orchestrator" => parse_orchestrator(node, &mut config.orchestrator)?,
            "builder" => parse_builder(node, &mut config.builder)?,
            "notifier" => parse_notifier(node, &mut config.notifier)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_bus(node: &KdlNode, bus: &mut BusSettings) -> ConfigResult<()> {
    if let Some(backend) = get_string_prop(node, "backend") {
        bus.backend = backend.parse()?;
    }
    if let Some(url) = get_string_prop(node, "url") {
        bus.url = Some(url);
    }
    if let Some(partitions) = get_u64_prop(node, "partitions")? {
        bus.partitions = narrow(node, "partitions", partitions)?;
    }
    if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
        bus.poll_interval_ms = ms;
    }
    if let Some(secs) = get_u64_prop(node, "lease-secs")? {
        bus.lease_secs = secs;
    }
    if let Some(hours) = get_u64_prop(node, "retention-hours")? {
        bus.retention_hours = hours;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "backoff" {
                let backoff = &mut bus.subscribe_backoff;
                if let Some(ms) = get_u64_prop(child, "initial-ms")? {
                    backoff.initial_ms = ms;
                }
                if let Some(multiplier) = get_f64_prop(child, "multiplier")? {
                    backoff.multiplier = multiplier;
                }
                if let Some(attempts) = get_u64_prop(child, "max-attempts")? {
                    backoff.max_attempts = narrow(child, "max-attempts", attempts)?;
                }
            }
        }
    }
    Ok(())
}

fn parse_store(node: &KdlNode, store: &mut StoreSettings) -> ConfigResult<()> {
    if let Some(backend) = get_string_prop(node, "backend") {
        store.backend = backend.parse()?;
    }
    if let Some(url) = get_string_prop(node, "url") {
        store.url = Some(url);
    }
    if let Some(hours) = get_u64_prop(node, "retention-hours")? {
        store.retention_hours = hours;
    }
    if let Some(max) = get_u64_prop(node, "max-connections")? {
        store.max_connections = narrow(node, "max-connections", max)?;
    }
    Ok(())
}

fn parse_orchestrator(node: &KdlNode, orchestrator: &mut OrchestratorSettings) -> ConfigResult<()> {
    if let Some(listen) = get_addr_prop(node, "listen")? {
        orchestrator.listen = listen;
    }
    if let Some(secs) = get_u64_prop(node, "max-queued-age-secs")? {
        orchestrator.max_queued_age_secs = secs;
    }
    if let Some(secs) = get_u64_prop(node, "stall-check-interval-secs")? {
        orchestrator.stall_check_interval_secs = secs;
    }
    if let Some(secs) = get_u64_prop(node, "purge-interval-secs")? {
        orchestrator.purge_interval_secs = secs;
    }
    Ok(())
}

fn parse_builder(node: &KdlNode, builder: &mut BuilderSettings) -> ConfigResult<()> {
    if let Some(listen) = get_addr_prop(node, "listen")? {
        builder.listen = listen;
    }
    if let Some(dir) = get_string_prop(node, "work-dir") {
        builder.work_dir = PathBuf::from(dir);
    }
    if let Some(url) = get_string_prop(node, "storage-url") {
        builder.storage_url = url;
    }
    if let Some(secs) = get_u64_prop(node, "step-timeout-secs")? {
        builder.step_timeout_secs = secs;
    }
    if let Some(secs) = get_u64_prop(node, "upload-timeout-secs")? {
        builder.upload_timeout_secs = secs;
    }
    if let Some(id) = get_string_prop(node, "worker-id") {
        builder.worker_id = id;
    }
    if let Some(url) = get_string_prop(node, "orchestrator-url") {
        builder.orchestrator_url = Some(url);
    }
    Ok(())
}

fn parse_notifier(node: &KdlNode, notifier: &mut NotifierSettings) -> ConfigResult<()> {
    if let Some(listen) = get_addr_prop(node, "listen")? {
        notifier.listen = listen;
    }
    if let Some(capacity) = get_u64_prop(node, "channel-capacity")? {
        notifier.channel_capacity = narrow(node, "channel-capacity", capacity)?;
    }
    Ok(())
}

fn field_name(node: &KdlNode, name: &str) -> String {
    format!("{}.{}", node.name().value(), name)
}

fn narrow<T: TryFrom<u64>>(node: &KdlNode, name: &str, value: u64) -> ConfigResult<T> {
    T::try_from(value).map_err(|_| ConfigError::invalid(field_name(node, name), "value out of range"))
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(field_name(node, name), "expected a non-negative integer")
            }),
    }
}

fn get_f64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<f64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(field_name(node, name), "expected a number")),
    }
}

fn get_addr_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<SocketAddr>> {
    match get_string_prop(node, name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            ConfigError::invalid(
                field_name(node, name),
                format!("'{}' is not a socket address", raw),
            )
        }),
    }
}
