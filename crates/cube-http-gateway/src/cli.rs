//! Command line for the gateway binary.
//!
//! Every flag falls back to a `GATEWAY_*` environment variable. Bus host, bus
//! port and the signing secret are required.

use crate::settings::{
    PARAM_DEV, PARAM_ENDPOINTS_MAP, PARAM_JWT_SECRET, PARAM_ONLY_AUTHORIZED, PARAM_PORT,
    PARAM_TIMEOUT_MS,
};
use clap::Parser;
use cube_node::{CubeError, NodeConfig};
use std::path::PathBuf;

/// Node class of the gateway.
pub const GATEWAY_CLASS: &str = "http-gateway";

#[derive(Parser, Debug, Clone)]
#[command(name = "cube-http-gateway", version, about = "HTTP to bus gateway cube")]
pub struct GatewayCli {
    /// Bus host
    #[arg(long, env = "GATEWAY_BUS_HOST")]
    pub bus_host: Option<String>,

    /// Bus port
    #[arg(long, env = "GATEWAY_BUS_PORT")]
    pub bus_port: Option<u16>,

    /// HS512 token secret
    #[arg(long, env = "GATEWAY_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long, env = "GATEWAY_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Routing table: `uri:channel;uri:channel`
    #[arg(long, env = "GATEWAY_ENDPOINTS_MAP")]
    pub endpoints_map: Option<String>,

    /// Reject requests without a valid token
    #[arg(long, env = "GATEWAY_ONLY_AUTHORIZED_REQUESTS", value_name = "BOOL")]
    pub only_authorized_requests: Option<bool>,

    /// Dump requests and replies at debug level
    #[arg(long, env = "GATEWAY_DEV")]
    pub dev: bool,

    /// HTTP listen port
    #[arg(long, env = "GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Optional node configuration file; flags override it
    #[arg(long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,
}

impl GatewayCli {
    /// Node configuration for the gateway cube.
    pub fn node_config(&self) -> Result<NodeConfig, CubeError> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::new(GATEWAY_CLASS),
        };
        if config.class.is_empty() {
            config.class = GATEWAY_CLASS.to_string();
        }

        config.bus_host = self
            .bus_host
            .clone()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| CubeError::Configuration("bus host is required".into()))?;
        config.bus_port = self
            .bus_port
            .filter(|port| *port != 0)
            .ok_or_else(|| CubeError::Configuration("bus port is required".into()))?;
        let secret = self
            .jwt_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| CubeError::Configuration("jwt secret is required".into()))?;

        config.params.insert(PARAM_JWT_SECRET.into(), secret);
        if let Some(timeout) = self.timeout {
            config.params.insert(PARAM_TIMEOUT_MS.into(), timeout.to_string());
        }
        if let Some(map) = &self.endpoints_map {
            config.params.insert(PARAM_ENDPOINTS_MAP.into(), map.clone());
        }
        if let Some(only) = self.only_authorized_requests {
            config.params.insert(PARAM_ONLY_AUTHORIZED.into(), only.to_string());
        }
        if self.dev {
            config.params.insert(PARAM_DEV.into(), "true".into());
        }
        if let Some(port) = self.port {
            config.params.insert(PARAM_PORT.into(), port.to_string());
        }

        config.validate()?;
        Ok(config)
    }

    /// Default log filter when `RUST_LOG` is not set.
    #[must_use]
    pub fn default_log_filter(&self) -> &'static str {
        if self.dev {
            "debug"
        } else {
            "info"
        }
    }
}
