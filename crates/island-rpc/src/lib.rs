//! Broker-mediated RPC for cooperating services.
//!
//! Each deployed service instance (an "island") exposes named procedures
//! and invokes other services' procedures over a message broker with
//! durable-style queues, per-message acknowledgement, correlation ids and
//! reply-to routing.
//!
//! The engine pairs a response multiplexer (one private reply queue,
//! replies routed to waiting callers by correlation id) with a registration
//! pipeline (schema guards, pre/post/error hooks, an execution timeout and
//! a failure protocol that distinguishes discardable, replyable and
//! requeueable errors). A per-request trace id (the tattoo) rides the
//! message headers across any number of hops.
//!
//! ```ignore
//! let pool = Arc::new(MemoryChannelPool::new(MemoryBroker::new()));
//! let service = RpcService::new("accounts", pool, RpcConfig::from_env());
//! service.listen().await?;
//!
//! service
//!     .register(
//!         "get_balance",
//!         |req, _scope| async move { Ok(req) },
//!         CallKind::Rpc,
//!         RpcOptions::default(),
//!     )
//!     .await?;
//!
//! let balance = service.invoke("get_balance", json!({"user": 7})).await?;
//! ```

mod config;
mod error;
mod hooks;
mod options;
mod service;
mod tracelog;

pub use config::{
    RpcConfig, DEFAULT_EXEC_TIMEOUT, DEFAULT_PREFETCH, DEFAULT_SERVICE_LOAD_TIME,
    DEFAULT_WAIT_TIMEOUT,
};
pub use error::{InvokeError, RpcServiceError};
pub use hooks::{Hook, HookRegistry, RpcHookType};
pub use options::{
    InvokeOptions, InvokeReply, RpcOptions, Sanitizer, SchemaGuard, SchemaOptions, Validator,
};
pub use service::{Handler, RpcService};
