//! Wire types for island inter-service RPC.
//!
//! This crate defines everything that crosses the broker between two
//! services:
//!
//! - the versioned reply envelope and its JSON codec ([`codec`]),
//! - the LOGIC/FATAL/ETC error taxonomy and its wire shape ([`error`]),
//! - the trace scope and message headers that carry the tattoo across hops
//!   ([`scope`]).
//!
//! The payload format is fixed UTF-8 JSON text; responses are
//! self-describing by `version`, with `version=0` reserved for payloads the
//! receiver could not decode.

pub mod codec;
mod envelope;
mod error;
mod scope;

pub use codec::{decode_response, encode_response, DecodedResponse, Reviver};
pub use envelope::{ResponseEnvelope, CURRENT_VERSION, UNDECODABLE_VERSION};
pub use error::{ErrorKind, ErrorShape, EtcCode, FatalCode, LogicCode, RpcError};
pub use scope::{CallKind, MessageHeaders, Origin, TraceScope};
