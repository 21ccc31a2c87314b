//! Wire envelopes.
//!
//! Outbound calls are `{"id", "method", "params"}`. Inbound frames are either
//! responses (`{"id", "result"}` / `{"id", "error"}`) or events
//! (`{"method", "params"}` with no `id`).

use crate::{DevToolsError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEnvelope {
    pub id: u64,
    pub method: String,
    pub params: Map<String, Value>,
}

impl CallEnvelope {
    /// `params` must be a JSON object or `null` (sent as `{}`).
    pub fn new(id: u64, domain: &str, method: &str, params: Value) -> Result<Self> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DevToolsError::InvalidParams(format!(
                    "params for {domain}.{method} must be an object, got {other}"
                )))
            }
        };

        Ok(Self {
            id,
            method: qualified_method(domain, method),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<ResponseError> for DevToolsError {
    fn from(err: ResponseError) -> Self {
        DevToolsError::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub outcome: std::result::Result<Value, ResponseError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub method: String,
    pub params: Value,
}

impl EventEnvelope {
    pub fn domain(&self) -> &str {
        split_method(&self.method).map(|(d, _)| d).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(ResponseEnvelope),
    Event(EventEnvelope),
}

pub fn qualified_method(domain: &str, method: &str) -> String {
    format!("{domain}.{method}")
}

/// Splits `"Domain.method"` at the first dot.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    method
        .split_once('.')
        .filter(|(domain, name)| !domain.is_empty() && !name.is_empty())
}

pub fn encode(call: &CallEnvelope) -> Result<String> {
    serde_json::to_string(call)
        .map_err(|e| DevToolsError::InvalidParams(format!("failed to serialize call {}: {e}", call.id)))
}

pub fn decode(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| DevToolsError::Decode(format!("invalid JSON frame: {e}")))?;

    let Value::Object(mut frame) = value else {
        return Err(DevToolsError::Decode("frame is not a JSON object".into()));
    };

    if let Some(id) = frame.get("id") {
        let id = id
            .as_u64()
            .ok_or_else(|| DevToolsError::Decode(format!("response id is not an integer: {id}")))?;

        if let Some(error) = frame.remove("error") {
            let error: ResponseError = serde_json::from_value(error)
                .map_err(|e| DevToolsError::Decode(format!("malformed error object: {e}")))?;
            return Ok(Inbound::Response(ResponseEnvelope {
                id,
                outcome: Err(error),
            }));
        }

        let result = frame.remove("result").ok_or_else(|| {
            DevToolsError::Decode(format!("response {id} has neither result nor error"))
        })?;
        return Ok(Inbound::Response(ResponseEnvelope {
            id,
            outcome: Ok(result),
        }));
    }

    let method = match frame.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err(DevToolsError::Decode(
                "frame has neither id nor method".into(),
            ))
        }
    };

    if split_method(&method).is_none() {
        return Err(DevToolsError::Decode(format!(
            "event method is not domain-qualified: {method}"
        )));
    }

    let params = frame.remove("params").unwrap_or_else(|| Value::Object(Map::new()));
    Ok(Inbound::Event(EventEnvelope { method, params }))
}
