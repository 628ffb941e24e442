//! Registration and invocation options.

use std::sync::Arc;

use island_proto::TraceScope;
use serde_json::Value;

/// Transformer applied to a request or result before validation. The real
/// schema utilities live outside the engine; anything `Value -> Value`
/// plugs in here.
pub type Sanitizer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Predicate applied to a request or result; `false` fails the message with
/// `L0002_WRONG_PARAMETER_SCHEMA`.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Sanitize/validate pair for one direction of a procedure.
#[derive(Clone, Default)]
pub struct SchemaGuard {
    pub sanitization: Option<Sanitizer>,
    pub validation: Option<Validator>,
}

impl SchemaGuard {
    #[must_use]
    pub fn sanitize<F>(mut self, sanitizer: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.sanitization = Some(Arc::new(sanitizer));
        self
    }

    #[must_use]
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validation = Some(Arc::new(validator));
        self
    }
}

/// Input (`query`) and output (`result`) guards for a procedure.
#[derive(Clone, Default)]
pub struct SchemaOptions {
    pub query: Option<SchemaGuard>,
    pub result: Option<SchemaGuard>,
}

/// Options accepted by `register`.
#[derive(Clone, Default)]
pub struct RpcOptions {
    pub schema: Option<SchemaOptions>,
}

impl RpcOptions {
    #[must_use]
    pub fn with_schema(schema: SchemaOptions) -> Self {
        Self {
            schema: Some(schema),
        }
    }
}

/// Options accepted by `invoke_with`.
#[derive(Clone, Default)]
#[must_use]
pub struct InvokeOptions {
    /// Trace scope of the calling task; absent for root calls. The
    /// outbound request inherits its tattoo.
    pub scope: Option<TraceScope>,
    /// Also return the raw reply payload alongside the decoded body.
    pub with_raw: bool,
}

impl InvokeOptions {
    pub fn scoped(scope: &TraceScope) -> Self {
        Self {
            scope: Some(scope.clone()),
            with_raw: false,
        }
    }

    pub fn with_raw(mut self) -> Self {
        self.with_raw = true;
        self
    }
}

/// Reply returned by `invoke_with`.
#[derive(Debug, Clone)]
pub struct InvokeReply {
    /// The decoded reply body.
    pub body: Value,
    /// The raw reply payload, present when requested via
    /// [`InvokeOptions::with_raw`].
    pub raw: Option<Vec<u8>>,
}
