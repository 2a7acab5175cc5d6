//! # Envelopes
//!
//! The versioned JSON structures carried as bus payloads.
//!
//! ```text
//! Message  {version, id?, method, params}      fire-and-forget
//! Request  {version, method, params}           reply expected (transport correlates)
//! Response {version, result?, errors?}         exactly one of result/errors is meaningful
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope protocol version.
pub const ENVELOPE_VERSION: &str = "1";

fn default_version() -> String {
    ENVELOPE_VERSION.to_string()
}

/// Fire-and-forget payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "default_version")]
    pub version: String,
    /// Sender-side identity, when one is meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Message {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            version: default_version(),
            id: None,
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Payload sent when a reply is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub version: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            version: default_version(),
            method: method.into(),
            params,
        }
    }
}

/// Application-level error carried inside a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            description: description.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub version: String,
    /// Opaque result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ResponseError>>,
}

impl Response {
    /// Successful response carrying `result`.
    pub fn success(result: Value) -> Self {
        Self {
            version: default_version(),
            result: Some(result),
            errors: None,
        }
    }

    /// Successful response with no payload.
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            result: None,
            errors: None,
        }
    }

    /// Failed response carrying a single error.
    pub fn error(
        code: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::from_errors(vec![ResponseError::new(code, name, description)])
    }

    /// Failed response carrying several errors, in order.
    pub fn from_errors(errors: Vec<ResponseError>) -> Self {
        Self {
            version: default_version(),
            result: None,
            errors: Some(errors),
        }
    }

    /// Fallback the dispatcher publishes when the handler could not produce
    /// a response at all.
    pub(crate) fn internal_error(description: impl Into<String>) -> Self {
        Self::error("500", "InternalError", description)
    }

    /// True when at least one error is present.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }
}
