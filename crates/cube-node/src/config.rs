//! Node configuration.
//!
//! Loaded from a JSON file (camelCase keys) or built in code. Every field is
//! optional; missing fields take the defaults below.

use crate::channel::{BusSubject, Channel, ChannelMapper};
use crate::error::{CubeError, CubeResult};
use crate::pool::{DEFAULT_BORROW_TIMEOUT, DEFAULT_POOL_SIZE};
use cube_bus::{DEFAULT_BUS_HOST, DEFAULT_BUS_PORT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Default bound on each shutdown step.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup configuration of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub schema_version: String,
    pub version: String,
    pub bus_host: String,
    pub bus_port: u16,
    /// Instance id. Generated when empty.
    pub name: String,
    pub class: String,
    pub source: String,
    pub params: BTreeMap<String, String>,
    /// Queue group shared by every instance of a load-balanced service.
    pub queue_group: String,
    /// `logical → physical` channel table.
    pub channels_mapping: BTreeMap<String, String>,
    pub pool_size: usize,
    pub borrow_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Reject two channels mapped to the same subject.
    pub strict_channel_mapping: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            schema_version: String::new(),
            version: String::new(),
            bus_host: DEFAULT_BUS_HOST.to_string(),
            bus_port: DEFAULT_BUS_PORT,
            name: String::new(),
            class: String::new(),
            source: String::new(),
            params: BTreeMap::new(),
            queue_group: String::new(),
            channels_mapping: BTreeMap::new(),
            pool_size: DEFAULT_POOL_SIZE,
            borrow_timeout_ms: DEFAULT_BORROW_TIMEOUT.as_millis() as u64,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            strict_channel_mapping: true,
        }
    }
}

impl NodeConfig {
    /// Configuration for a node of `class` with every other field defaulted.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> CubeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CubeError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(raw: &str) -> CubeResult<Self> {
        let config: NodeConfig = serde_json::from_str(raw)
            .map_err(|e| CubeError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CubeResult<()> {
        if self.bus_host.trim().is_empty() {
            return Err(CubeError::Configuration("bus host is empty".into()));
        }
        if self.bus_port == 0 {
            return Err(CubeError::Configuration("bus port is zero".into()));
        }
        if self.pool_size == 0 {
            return Err(CubeError::Configuration("pool size must be positive".into()));
        }
        for (channel, subject) in &self.channels_mapping {
            if channel.is_empty() || subject.is_empty() {
                return Err(CubeError::Configuration(format!(
                    "empty name in channel mapping {channel:?} -> {subject:?}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = group.into();
        self
    }

    #[must_use]
    pub fn with_channel_mapping(
        mut self,
        channel: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        self.channels_mapping.insert(channel.into(), subject.into());
        self
    }

    /// `nats://host:port`.
    #[must_use]
    pub fn bus_address(&self) -> String {
        format!("nats://{}:{}", self.bus_host, self.bus_port)
    }

    /// The configured instance id, or a fresh UUID when none was given.
    #[must_use]
    pub fn resolve_instance_id(&self) -> String {
        if self.name.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.name.clone()
        }
    }

    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        Some(self.queue_group.as_str()).filter(|g| !g.is_empty())
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Build the channel mapper for this node.
    pub fn channel_mapper(&self) -> CubeResult<ChannelMapper> {
        let table: BTreeMap<Channel, BusSubject> = self
            .channels_mapping
            .iter()
            .map(|(channel, subject)| (Channel::from(channel.as_str()), BusSubject::from(subject.as_str())))
            .collect();
        ChannelMapper::new(table, self.strict_channel_mapping)
    }
}
