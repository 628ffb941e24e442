//! Encoding and decoding of reply payloads.
//!
//! Replies are UTF-8 JSON text carrying a [`ResponseEnvelope`]. Encoding
//! never fails: values that cannot be serialised collapse to a best-effort
//! textual form. Decoding maps parse failures to a typed
//! `E0001_UNDECODABLE_RESPONSE` error rather than an empty rejection.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::envelope::ResponseEnvelope;
use crate::error::{ErrorShape, EtcCode, RpcError};

/// A decode-time value transformer, applied bottom-up to every decoded
/// object entry (array indices are passed as decimal keys, the root as `""`).
/// Typical use is rehydrating date strings into richer values.
pub type Reviver = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Result of decoding a reply payload.
#[derive(Debug)]
pub struct DecodedResponse {
    /// The parsed envelope, or [`ResponseEnvelope::undecodable`] when the
    /// payload did not parse.
    pub envelope: ResponseEnvelope,
    /// The semantic outcome: the reply body, or the rehydrated error.
    pub outcome: Result<Value, RpcError>,
}

/// Encodes a handler outcome into reply bytes.
///
/// Failures are serialised to [`ErrorShape`] with `occurredIn` stamped with
/// the originating service.
#[must_use]
pub fn encode_response(outcome: Result<&Value, &RpcError>, occurred_in: &str) -> Vec<u8> {
    let envelope = match outcome {
        Ok(body) => ResponseEnvelope::success(body.clone()),
        Err(err) => ResponseEnvelope::failure(&ErrorShape::from_error(err, occurred_in)),
    };
    serde_json::to_vec(&envelope).unwrap_or_else(|_| {
        let fallback = ResponseEnvelope::success(Value::String(envelope.body.to_string()));
        serde_json::to_vec(&fallback).unwrap_or_else(|_| b"{\"version\":0,\"result\":false}".to_vec())
    })
}

/// Decodes reply bytes into an envelope and a typed outcome.
#[must_use]
pub fn decode_response(bytes: &[u8], reviver: Option<&Reviver>) -> DecodedResponse {
    let envelope: ResponseEnvelope = match serde_json::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "reply payload could not be parsed");
            return DecodedResponse {
                envelope: ResponseEnvelope::undecodable(),
                outcome: Err(RpcError::etc(
                    EtcCode::UndecodableResponse,
                    format!("reply payload could not be parsed: {err}"),
                )),
            };
        }
    };

    let body = match reviver {
        Some(reviver) => revive("", envelope.body.clone(), reviver),
        None => envelope.body.clone(),
    };

    let outcome = if envelope.result {
        Ok(body)
    } else {
        match serde_json::from_value::<ErrorShape>(body) {
            Ok(shape) => Err(shape.into_error()),
            Err(err) => Err(RpcError::etc(
                EtcCode::UndecodableResponse,
                format!("reply error body missing or malformed: {err}"),
            )),
        }
    };

    DecodedResponse { envelope, outcome }
}

fn revive(key: &str, value: Value, reviver: &Reviver) -> Value {
    let value = match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let revived = revive(&k, v, reviver);
                    (k, revived)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| revive(&i.to_string(), v, reviver))
                .collect(),
        ),
        other => other,
    };
    reviver(key, value)
}
