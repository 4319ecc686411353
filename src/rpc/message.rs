//! JSON-RPC 2.0 message model.
//!
//! Classification follows the wire shape rather than a declared type:
//!
//! | `id`    | `method` | Kind                          |
//! |---------|----------|-------------------------------|
//! | present | present  | [`Message::Request`]          |
//! | absent  | present  | [`Message::Notification`]     |
//! | present | absent   | [`Message::Response`]         |
//! | absent  | absent   | rejected as a payload error   |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Protocol version stamped on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unsupported method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Short description supplied by the responder.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for AppError {
    fn from(err: RpcErrorObject) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// One decoded or to-be-encoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call expecting exactly one response with the same `id`.
    Request {
        /// Correlation identifier.
        id: Value,
        /// Method name.
        method: String,
        /// Method parameters, omitted from the wire when `None`.
        params: Option<Value>,
    },
    /// Fire-and-forget call.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters, omitted from the wire when `None`.
        params: Option<Value>,
    },
    /// Answer to an earlier request.
    Response {
        /// Identifier of the request being answered.
        id: Value,
        /// `result` on success, `error` on failure.
        outcome: std::result::Result<Value, RpcErrorObject>,
    },
}

impl Message {
    /// Build an outbound request with a numeric id.
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: Value::from(id),
            method: method.into(),
            params,
        }
    }

    /// Build an outbound notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a response carrying a result.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self::Response {
            id,
            outcome: Ok(result),
        }
    }

    /// Build a response carrying an error object.
    #[must_use]
    pub fn failure(id: Value, error: RpcErrorObject) -> Self {
        Self::Response {
            id,
            outcome: Err(error),
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Classify a parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Payload`] when the value is not an object, when it
    /// carries neither `id` nor `method`, or when `method` or `error` have
    /// the wrong shape.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(AppError::Payload("message is not a json object".into()));
        };

        let id = map.remove("id").filter(|v| !v.is_null());
        let method = match map.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(other) => {
                return Err(AppError::Payload(format!(
                    "method must be a string, got {other}"
                )))
            }
        };
        let params = map.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                let outcome = match map.remove("error") {
                    Some(err) if !err.is_null() => {
                        let obj: RpcErrorObject = serde_json::from_value(err).map_err(|e| {
                            AppError::Payload(format!("malformed error object: {e}"))
                        })?;
                        Err(obj)
                    }
                    _ => Ok(map.remove("result").unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, None) => Err(AppError::Payload(
                "message has neither id nor method".into(),
            )),
        }
    }

    /// Render as a JSON-RPC 2.0 object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                map.insert("id".into(), id.clone());
                map.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    map.insert("params".into(), params.clone());
                }
            }
            Self::Notification { method, params } => {
                map.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    map.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                map.insert("id".into(), id.clone());
                match outcome {
                    Ok(result) => {
                        map.insert("result".into(), result.clone());
                    }
                    Err(err) => {
                        map.insert(
                            "error".into(),
                            serde_json::to_value(err).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Value::Object(map)
    }
}
