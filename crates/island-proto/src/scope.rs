//! Trace scope and message headers.
//!
//! The trace scope is an explicit immutable record threaded through every
//! handler invocation and outbound call, rather than an ambient
//! continuation-local store. Nested calls read and forward it, so a chain of
//! RPC hops shares one tattoo.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two call kinds sharing the registration path. They differ only in
/// which hook chain runs around the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    #[serde(rename = "rpc")]
    Rpc,
    #[serde(rename = "endpoint")]
    Endpoint,
}

impl CallKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Endpoint => "endpoint",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request trace context: the end-to-end trace id (tattoo), the current
/// procedure name, and the call kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceScope {
    pub tattoo: Option<String>,
    pub context: String,
    pub kind: CallKind,
}

impl TraceScope {
    /// Creates a scope for a handler invocation, inheriting the inbound
    /// tattoo when present.
    #[must_use]
    pub fn new(tattoo: Option<String>, context: impl Into<String>, kind: CallKind) -> Self {
        Self {
            tattoo,
            context: context.into(),
            kind,
        }
    }

    /// Creates a root scope with a freshly minted tattoo, for call chains
    /// that originate locally rather than from an inbound request.
    #[must_use]
    pub fn root(context: impl Into<String>, kind: CallKind) -> Self {
        Self {
            tattoo: Some(Uuid::new_v4().to_string()),
            context: context.into(),
            kind,
        }
    }
}

/// The `headers.from` stamp identifying the message origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default)]
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub island: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CallKind>,
}

/// Application headers carried on every request message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tattoo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Origin>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_kind_wire_strings() {
        assert_eq!(CallKind::Rpc.as_str(), "rpc");
        assert_eq!(
            serde_json::to_value(CallKind::Endpoint).unwrap(),
            serde_json::json!("endpoint")
        );
    }

    #[test]
    fn root_scope_mints_tattoo() {
        let a = TraceScope::root("boot", CallKind::Rpc);
        let b = TraceScope::root("boot", CallKind::Rpc);
        assert!(a.tattoo.is_some());
        assert_ne!(a.tattoo, b.tattoo);
    }

    #[test]
    fn headers_serde_uses_type_field() {
        let headers = MessageHeaders {
            tattoo: Some("t-1".to_owned()),
            from: Some(Origin {
                node: "host-a".to_owned(),
                context: Some("create_user".to_owned()),
                island: "accounts".to_owned(),
                kind: Some(CallKind::Rpc),
            }),
        };
        let value = serde_json::to_value(&headers).unwrap();
        assert_eq!(value["from"]["type"], "rpc");
        let back: MessageHeaders = serde_json::from_value(value).unwrap();
        assert_eq!(back, headers);
    }

    #[test]
    fn empty_headers_deserialise() {
        let headers: MessageHeaders = serde_json::from_str("{}").unwrap();
        assert!(headers.tattoo.is_none());
        assert!(headers.from.is_none());
    }
}
