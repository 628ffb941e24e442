//! Response envelope wrapping every reply payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorShape;

/// Current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// Version stamped on payloads that failed to parse.
pub const UNDECODABLE_VERSION: u32 = 0;

/// The versioned reply envelope: `{version, result, body}`.
///
/// `version=1` is the current schema; `version=0, result=false` denotes a
/// payload the receiver could not decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub version: u32,
    pub result: bool,
    #[serde(default)]
    pub body: Value,
}

impl ResponseEnvelope {
    /// Wraps a successful handler result.
    #[must_use]
    pub fn success(body: Value) -> Self {
        Self {
            version: CURRENT_VERSION,
            result: true,
            body,
        }
    }

    /// Wraps a failure body.
    #[must_use]
    pub fn failure(shape: &ErrorShape) -> Self {
        Self {
            version: CURRENT_VERSION,
            result: false,
            body: serde_json::to_value(shape).unwrap_or(Value::Null),
        }
    }

    /// The degenerate envelope produced when a payload cannot be parsed.
    #[must_use]
    pub const fn undecodable() -> Self {
        Self {
            version: UNDECODABLE_VERSION,
            result: false,
            body: Value::Null,
        }
    }

    /// Whether this envelope carries the current schema version.
    #[must_use]
    pub const fn is_current(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LogicCode, RpcError};
    use serde_json::json;

    #[test]
    fn success_envelope() {
        let env = ResponseEnvelope::success(json!({"a": 1}));
        assert_eq!(env.version, CURRENT_VERSION);
        assert!(env.result);
        assert!(env.is_current());
    }

    #[test]
    fn failure_envelope_carries_shape() {
        let err = RpcError::logic(LogicCode::WrongParameterSchema, "nope");
        let env = ResponseEnvelope::failure(&ErrorShape::from_error(&err, "svc"));
        assert!(!env.result);
        assert_eq!(env.body["errorType"], "LOGIC");
        assert_eq!(env.body["occurredIn"], "svc");
    }

    #[test]
    fn undecodable_is_not_current() {
        let env = ResponseEnvelope::undecodable();
        assert_eq!(env.version, 0);
        assert!(!env.result);
        assert!(!env.is_current());
    }

    #[test]
    fn serde_roundtrip() {
        let env = ResponseEnvelope::success(json!([1, 2, 3]));
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: ResponseEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(env, back);
    }
}
