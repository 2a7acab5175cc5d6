//! JSON shapes exchanged with the routed node.
//!
//! ```text
//! request params  {inputTime, method, host, remoteAddr, requestURI, body,
//!                  userId?, deviceId?, headers}
//! reply result    {status, body}
//! ```
//!
//! Bodies are a JSON string when they are valid UTF-8 and an array of bytes
//! otherwise. Empty bodies are `null`.

use crate::auth::Identity;
use crate::error::GatewayError;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use cube_node::{Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTP body carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Text(String),
    Binary(Vec<u8>),
}

impl Body {
    /// `None` for an empty body.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(match std::str::from_utf8(bytes) {
            Ok(text) => Body::Text(text.to_string()),
            Err(_) => Body::Binary(bytes.to_vec()),
        })
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Body::Text(text) => Bytes::from(text),
            Body::Binary(bytes) => Bytes::from(bytes),
        }
    }
}

/// Params of the request sent to the routed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    /// Arrival time, unix nanoseconds.
    pub input_time: i64,
    pub method: String,
    pub host: String,
    pub remote_addr: String,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub body: Option<Body>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl RequestParams {
    /// Group header values by name, in arrival order.
    pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
        let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            collected
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        collected
    }

    pub fn with_identity(mut self, identity: Option<&Identity>) -> Self {
        if let Some(identity) = identity {
            self.user_id = Some(identity.user_id.clone());
            self.device_id = Some(identity.device_id.clone());
        }
        self
    }

    /// Wrap into a node request named after the HTTP method.
    pub fn into_request(self) -> Result<Request, GatewayError> {
        let method = self.method.clone();
        Ok(Request::new(method, serde_json::to_value(self)?))
    }
}

/// HTTP answer produced by the routed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReply {
    pub status: u16,
    #[serde(default)]
    pub body: Option<Body>,
}

impl HttpReply {
    pub fn new(status: StatusCode, body: Option<Body>) -> Self {
        Self {
            status: status.as_u16(),
            body,
        }
    }

    /// Only a reason phrase as body.
    pub fn canonical(status: StatusCode) -> Self {
        Self::new(
            status,
            status.canonical_reason().map(|reason| Body::Text(reason.to_string())),
        )
    }

    pub fn status_code(&self) -> Result<StatusCode, GatewayError> {
        StatusCode::from_u16(self.status)
            .map_err(|_| GatewayError::BadReply(format!("invalid status {}", self.status)))
    }

    /// Translate a node response into an HTTP answer.
    ///
    /// - `result` is decoded as `{status, body}`
    /// - errors only: the first error code when it is an HTTP status, else 500
    /// - neither: 204
    pub fn from_response(response: Response) -> Result<Self, GatewayError> {
        if let Some(result) = response.result.filter(|result| !result.is_null()) {
            let reply: HttpReply = serde_json::from_value(result)
                .map_err(|e| GatewayError::BadReply(e.to_string()))?;
            reply.status_code()?;
            return Ok(reply);
        }

        match response.errors.as_deref() {
            Some([first, ..]) => {
                let status = first
                    .code
                    .parse::<u16>()
                    .ok()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(Self::canonical(status))
            }
            _ => Ok(Self::new(StatusCode::NO_CONTENT, None)),
        }
    }
}
