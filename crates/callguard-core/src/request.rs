//! Call envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single outbound or inbound call.
///
/// The payload is opaque to the interceptor layer; only the method name is
/// inspected (for per-method limits and logging).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    /// A request with a `null` payload.
    pub fn empty(method: impl Into<String>) -> Self {
        Self::new(method, Value::Null)
    }
}

/// The reply to a [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_defaults_to_null() {
        let req: Request = serde_json::from_str(r#"{"method":"/users.v1/Get"}"#).unwrap();
        assert_eq!(req, Request::empty("/users.v1/Get"));
    }
}
