//! Error taxonomy shared between caller and callee.
//!
//! Three kinds travel over the wire: LOGIC (caller-attributable, e.g. a
//! request that fails schema validation), FATAL (engine-attributable, e.g.
//! an RPC timeout) and ETC (the receive-side bucket for anything that cannot
//! be rehydrated into a known kind). The serialised form is [`ErrorShape`];
//! the in-process form is [`RpcError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error kind discriminator, as it appears in the wire `errorType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "LOGIC")]
    Logic,
    #[serde(rename = "FATAL")]
    Fatal,
    #[serde(rename = "ETC")]
    Etc,
}

impl ErrorKind {
    /// Returns the wire tag of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logic => "LOGIC",
            Self::Fatal => "FATAL",
            Self::Etc => "ETC",
        }
    }

    /// Default error name for this kind.
    #[must_use]
    pub const fn default_name(self) -> &'static str {
        match self {
            Self::Logic => "LogicError",
            Self::Fatal => "FatalError",
            Self::Etc => "ETCError",
        }
    }

    const fn code_base(self) -> u32 {
        match self {
            Self::Logic => 10000,
            Self::Fatal => 20000,
            Self::Etc => 30000,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logic error codes raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicCode {
    /// Request or response failed schema validation.
    WrongParameterSchema,
}

impl LogicCode {
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::WrongParameterSchema => 2,
        }
    }

    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::WrongParameterSchema => "L0002_WRONG_PARAMETER_SCHEMA",
        }
    }

    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::WrongParameterSchema => 400,
        }
    }
}

/// Fatal error codes raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalCode {
    /// Caller-side wait timeout: no reply arrived in time.
    RpcTimeout,
    /// Callee-side execution timeout: hooks + handler overran.
    RpcExecTimeout,
    /// Request arrived without a `replyTo` property.
    MissingReplyTo,
}

impl FatalCode {
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::RpcTimeout => 23,
            Self::RpcExecTimeout => 24,
            Self::MissingReplyTo => 26,
        }
    }

    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::RpcTimeout => "F0023_RPC_TIMEOUT",
            Self::RpcExecTimeout => "F0024_RPC_EXEC_TIMEOUT",
            Self::MissingReplyTo => "F0026_MISSING_REPLY_TO",
        }
    }

    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::RpcTimeout => 504,
            Self::RpcExecTimeout => 500,
            Self::MissingReplyTo => 500,
        }
    }
}

/// ETC error codes raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EtcCode {
    /// Reply payload that could not be parsed.
    UndecodableResponse,
}

impl EtcCode {
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::UndecodableResponse => 1,
        }
    }

    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::UndecodableResponse => "E0001_UNDECODABLE_RESPONSE",
        }
    }

    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::UndecodableResponse => 500,
        }
    }
}

/// A typed RPC error, as thrown by handlers and observed by callers.
///
/// Carries a machine-readable `error_number`/`error_key` pair, an
/// HTTP-aligned `status_code`, and an `occurred_in` stamp naming the service
/// where the error was raised.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    pub stack: String,
    pub error_number: u32,
    pub error_key: String,
    pub error_code: u32,
    pub debug_msg: String,
    pub status_code: u16,
    pub occurred_in: String,
    pub extra: Value,
}

impl RpcError {
    fn new(
        kind: ErrorKind,
        number: u32,
        key: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let name = kind.default_name().to_owned();
        let message = message.into();
        let stack = format!("{name}: {message}");
        Self {
            kind,
            name,
            message,
            stack,
            error_number: number,
            error_key: key.into(),
            error_code: kind.code_base() + number,
            debug_msg: String::new(),
            status_code: status,
            occurred_in: String::new(),
            extra: Value::Null,
        }
    }

    /// Creates a logic error from a known code.
    #[must_use]
    pub fn logic(code: LogicCode, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Logic,
            code.number(),
            code.key(),
            code.status(),
            message,
        )
    }

    /// Creates a fatal error from a known code.
    #[must_use]
    pub fn fatal(code: FatalCode, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Fatal,
            code.number(),
            code.key(),
            code.status(),
            message,
        )
    }

    /// Creates an ETC error from a known code.
    #[must_use]
    pub fn etc(code: EtcCode, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Etc,
            code.number(),
            code.key(),
            code.status(),
            message,
        )
    }

    /// Creates an ETC error with an explicit name, used when wrapping
    /// foreign failures that carry no island error code.
    #[must_use]
    pub fn etc_named(name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Etc, 0, "E0000_UNKNOWN", 500, message);
        err.name = name.into();
        err.stack = format!("{}: {}", err.name, err.message);
        err
    }

    /// Overrides the status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }

    /// Attaches extra diagnostic payload.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    /// Attaches a debug message.
    #[must_use]
    pub fn with_debug_msg(mut self, debug_msg: impl Into<String>) -> Self {
        self.debug_msg = debug_msg.into();
        self
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.kind, self.error_key, self.message
        )
    }
}

impl std::error::Error for RpcError {}

/// Wire form of a failure body.
///
/// Field names follow the fixed payload format, hence camelCase on the wire.
/// Every field defaults so that partially populated bodies from older peers
/// still rehydrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorShape {
    pub name: String,
    pub message: String,
    pub stack: String,
    pub error_type: String,
    pub error_number: u32,
    pub error_key: String,
    pub error_code: u32,
    pub debug_msg: String,
    pub status_code: u16,
    pub occurred_in: String,
    pub extra: Value,
}

impl ErrorShape {
    /// Serialises an [`RpcError`] for the wire, stamping `occurredIn` with
    /// the originating service unless the error already carries one.
    #[must_use]
    pub fn from_error(err: &RpcError, occurred_in: &str) -> Self {
        let occurred_in = if err.occurred_in.is_empty() {
            occurred_in.to_owned()
        } else {
            err.occurred_in.clone()
        };
        Self {
            name: err.name.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
            error_type: err.kind.as_str().to_owned(),
            error_number: err.error_number,
            error_key: err.error_key.clone(),
            error_code: err.error_code,
            debug_msg: err.debug_msg.clone(),
            status_code: err.status_code,
            occurred_in,
            extra: err.extra.clone(),
        }
    }

    /// Rehydrates a typed error from the wire form.
    ///
    /// `LOGIC` and `FATAL` map onto their kinds; anything else becomes a
    /// generic ETC error named `ETCError`. `statusCode`, `stack`, `extra`
    /// and `occurredIn` are always copied through.
    #[must_use]
    pub fn into_error(self) -> RpcError {
        let (kind, name) = match self.error_type.as_str() {
            "LOGIC" => (ErrorKind::Logic, self.name),
            "FATAL" => (ErrorKind::Fatal, self.name),
            _ => (ErrorKind::Etc, "ETCError".to_owned()),
        };
        RpcError {
            kind,
            name,
            message: self.message,
            stack: self.stack,
            error_number: self.error_number,
            error_key: self.error_key,
            error_code: self.error_code,
            debug_msg: self.debug_msg,
            status_code: self.status_code,
            occurred_in: self.occurred_in,
            extra: self.extra,
        }
    }
}
