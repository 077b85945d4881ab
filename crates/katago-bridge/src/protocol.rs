// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line-delimited JSON messages exchanged with the engine.
//!
//! Requests are JSON objects with a string `id` assigned by the controller.
//! Responses echo that `id`. The `error` field of a response is decoded once,
//! here, into [`ResponseError`] so callers never inspect its raw shape.
//!
//! Two IDs are reserved and never assigned to caller queries:
//!
//! | ID | Purpose |
//! |----|---------|
//! | `health` | Protocol-level liveness probe |
//! | `startup` | Unsolicited output emitted while the engine warms up |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// ID used by liveness probes.
pub const HEALTH_ID: &str = "health";

/// ID of unsolicited warm-up output.
pub const STARTUP_ID: &str = "startup";

/// Prefix of caller query IDs (`q1`, `q2`, ...).
pub const QUERY_ID_PREFIX: char = 'q';

/// Render the wire ID for a caller query.
pub fn query_id(n: u64) -> String {
    format!("{}{}", QUERY_ID_PREFIX, n)
}

/// Parse a caller query ID back into its counter value.
pub fn parse_query_id(id: &str) -> Option<u64> {
    id.strip_prefix(QUERY_ID_PREFIX)?.parse().ok()
}

/// An analysis request. Fields are opaque to the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Map<String, Value>);

impl Query {
    /// Create an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Read a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Serialize as a single request line carrying `id`, newline included.
    ///
    /// Any caller-supplied `id` is overwritten.
    pub fn to_line(&self, id: &str) -> Result<String> {
        let mut fields = self.0.clone();
        fields.insert("id".to_string(), Value::String(id.to_string()));
        let mut line = serde_json::to_string(&fields)?;
        line.push('\n');
        Ok(line)
    }
}

impl TryFrom<Value> for Query {
    type Error = EngineError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EngineError::Transport(format!(
                "query must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }
}

impl From<Map<String, Value>> for Query {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Error reported by the engine for a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// Plain message.
    Message(String),
    /// Structured error with an optional code.
    Structured {
        /// Machine-readable code, if the engine sent one.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },
}

impl ResponseError {
    /// The human-readable message.
    pub fn message(&self) -> &str {
        match self {
            ResponseError::Message(m) => m,
            ResponseError::Structured { message, .. } => message,
        }
    }

    /// The code, for structured errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            ResponseError::Message(_) => None,
            ResponseError::Structured { code, .. } => code.as_deref(),
        }
    }

    fn decode(value: Value) -> Option<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Message(String),
            Structured {
                message: String,
                #[serde(default)]
                code: Option<Value>,
            },
            Other(Value),
        }

        if value.is_null() {
            return None;
        }
        let decoded = match serde_json::from_value::<Wire>(value) {
            Ok(Wire::Message(message)) => ResponseError::Message(message),
            Ok(Wire::Structured { message, code }) => ResponseError::Structured {
                code: code.and_then(|c| match c {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                }),
                message,
            },
            Ok(Wire::Other(other)) => ResponseError::Message(other.to_string()),
            Err(e) => ResponseError::Message(e.to_string()),
        };
        Some(decoded)
    }
}

impl From<ResponseError> for EngineError {
    fn from(err: ResponseError) -> Self {
        match err {
            ResponseError::Message(message) => EngineError::Process {
                code: None,
                message,
            },
            ResponseError::Structured { code, message } => EngineError::Process { code, message },
        }
    }
}

/// A decoded response line.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    id: String,
    error: Option<ResponseError>,
    raw: Map<String, Value>,
}

impl Response {
    /// Decode one output line.
    ///
    /// Fails if the line is not a JSON object. A missing or non-string `id`
    /// decodes as an empty ID, which matches no pending query.
    pub fn decode(line: &str) -> Result<Self> {
        let raw = match serde_json::from_str::<Value>(line.trim())? {
            Value::Object(map) => map,
            other => {
                return Err(EngineError::Transport(format!(
                    "expected a JSON object, got {}",
                    type_name(&other)
                )));
            }
        };

        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let error = raw.get("error").cloned().and_then(ResponseError::decode);

        Ok(Self { id, error, raw })
    }

    /// Correlation ID echoed by the engine.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Engine-reported error, if any.
    pub fn error(&self) -> Option<&ResponseError> {
        self.error.as_ref()
    }

    /// Non-fatal warning attached to the response.
    pub fn warning(&self) -> Option<&str> {
        self.raw.get("warning").and_then(Value::as_str)
    }

    /// True for warning-only lines the engine sends ahead of the real answer.
    pub fn is_warning_only(&self) -> bool {
        self.error.is_none() && self.warning().is_some() && self.raw.len() <= 3
    }

    /// The full decoded object.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Deserialize a single field, returning `None` if absent or mistyped.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.raw
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Convert an engine error into [`EngineError::Process`].
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self),
        }
    }

    /// Approximate in-memory size, used for cache accounting.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_string(&self.raw)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
