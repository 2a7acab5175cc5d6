//! Gateway settings, parsed once from the node parameters at start.

use crate::error::GatewayError;
use cube_node::Channel;
use std::collections::HashMap;
use std::time::Duration;

pub const PARAM_JWT_SECRET: &str = "jwtSecret";
pub const PARAM_TIMEOUT_MS: &str = "timeoutMs";
pub const PARAM_ENDPOINTS_MAP: &str = "endpointsMap";
pub const PARAM_ONLY_AUTHORIZED: &str = "onlyAuthorizedRequests";
pub const PARAM_DEV: &str = "dev";
pub const PARAM_PORT: &str = "port";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Request URI (path and query) to channel.
pub type EndpointsMap = HashMap<String, Channel>;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub jwt_secret: String,
    /// Wait for each routed request.
    pub timeout: Duration,
    /// When set, only listed URIs are routed.
    pub endpoints_map: Option<EndpointsMap>,
    pub only_authorized_requests: bool,
    /// Dump requests, routes and replies at debug level.
    pub dev: bool,
    pub port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            timeout: DEFAULT_TIMEOUT,
            endpoints_map: None,
            only_authorized_requests: true,
            dev: false,
            port: DEFAULT_HTTP_PORT,
        }
    }
}

impl GatewaySettings {
    /// Build settings from a parameter lookup. Missing or empty parameters
    /// take their defaults.
    pub fn from_params<F>(param: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| param(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let timeout = match get(PARAM_TIMEOUT_MS) {
            Some(raw) => Duration::from_millis(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| GatewayError::Settings(format!("wrong timeout: {raw}")))?,
            ),
            None => defaults.timeout,
        };

        let port = match get(PARAM_PORT) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| GatewayError::Settings(format!("wrong port: {raw}")))?,
            None => defaults.port,
        };

        Ok(Self {
            jwt_secret: get(PARAM_JWT_SECRET).unwrap_or_default(),
            timeout,
            endpoints_map: get(PARAM_ENDPOINTS_MAP)
                .map(|raw| parse_endpoints_map(&raw))
                .transpose()?,
            only_authorized_requests: parse_flag(
                PARAM_ONLY_AUTHORIZED,
                get(PARAM_ONLY_AUTHORIZED),
                defaults.only_authorized_requests,
            )?,
            dev: parse_flag(PARAM_DEV, get(PARAM_DEV), defaults.dev)?,
            port,
        })
    }

    /// Channel for a request. Without a table the HTTP method is the channel.
    pub fn route(&self, method: &str, request_uri: &str) -> Result<Channel, GatewayError> {
        match &self.endpoints_map {
            Some(map) => map
                .get(request_uri)
                .cloned()
                .ok_or_else(|| GatewayError::UnknownEndpoint(request_uri.to_string())),
            None => Ok(Channel::from(method)),
        }
    }
}

fn parse_flag(name: &str, raw: Option<String>, default: bool) -> Result<bool, GatewayError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(GatewayError::Settings(format!("{name} must be true or false, got {other}"))),
    }
}

/// Parse `uri:channel;uri:channel`. Empty segments are skipped.
pub fn parse_endpoints_map(raw: &str) -> Result<EndpointsMap, GatewayError> {
    let mut map = EndpointsMap::new();
    for entry in raw.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
        let mut parts = entry.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(uri), Some(channel), None) if !uri.is_empty() && !channel.is_empty() => {
                map.insert(uri.to_string(), Channel::from(channel));
            }
            _ => {
                return Err(GatewayError::Settings(format!(
                    "wrong endpoints map entry: {entry}"
                )))
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<GatewaySettings, GatewayError> {
        let params: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewaySettings::from_params(|key| params.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[(PARAM_JWT_SECRET, "s")]).unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.port, 80);
        assert!(settings.only_authorized_requests);
        assert!(!settings.dev);
        assert!(settings.endpoints_map.is_none());
    }

    #[test]
    fn test_explicit_values() {
        let settings = settings(&[
            (PARAM_TIMEOUT_MS, "50"),
            (PARAM_PORT, "8080"),
            (PARAM_ONLY_AUTHORIZED, "false"),
            (PARAM_DEV, "true"),
            (PARAM_ENDPOINTS_MAP, "/ping:svc.ping;/users?id=1:svc.users"),
        ])
        .unwrap();

        assert_eq!(settings.timeout, Duration::from_millis(50));
        assert_eq!(settings.port, 8080);
        assert!(!settings.only_authorized_requests);
        assert!(settings.dev);
        assert_eq!(settings.route("GET", "/ping").unwrap(), Channel::from("svc.ping"));
        assert_eq!(
            settings.route("GET", "/users?id=1").unwrap(),
            Channel::from("svc.users")
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(settings(&[(PARAM_TIMEOUT_MS, "soon")]).is_err());
        assert!(settings(&[(PARAM_PORT, "70000")]).is_err());
        assert!(settings(&[(PARAM_DEV, "yes")]).is_err());
        assert!(settings(&[(PARAM_ENDPOINTS_MAP, "/ping")]).is_err());
    }

    #[test]
    fn test_routing_without_map_uses_method() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.route("POST", "/anything").unwrap(), Channel::from("POST"));
    }

    #[test]
    fn test_unmapped_uri() {
        let settings = GatewaySettings {
            endpoints_map: Some(parse_endpoints_map("/ping:svc.ping").unwrap()),
            ..GatewaySettings::default()
        };
        assert!(matches!(
            settings.route("GET", "/pong"),
            Err(GatewayError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_endpoints_map_parsing() {
        let map = parse_endpoints_map("/a:svc.a; /b:svc.b;").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["/b"], Channel::from("svc.b"));

        assert!(parse_endpoints_map("/a:b:c").is_err());
        assert!(parse_endpoints_map(":svc").is_err());
    }
}
