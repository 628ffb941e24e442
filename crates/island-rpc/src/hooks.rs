//! Hook pipeline.
//!
//! Hooks are ordered chains of async transformers run before and after
//! handler invocation, and on error, per call kind. A chain runs as a left
//! fold (`value_{i+1} = hook_i(value_i)`); the empty chain is the identity.
//! A failing hook aborts the chain and sends the message down the error
//! branch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use island_proto::{CallKind, RpcError};
use serde_json::Value;
use tokio::sync::Mutex;

/// Hook attachment points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcHookType {
    PreEndpoint,
    PostEndpoint,
    PreRpc,
    PostRpc,
    PreEndpointError,
    PostEndpointError,
    PreRpcError,
    PostRpcError,
}

impl RpcHookType {
    /// The pre-invocation chain for a call kind.
    #[must_use]
    pub const fn pre(kind: CallKind) -> Self {
        match kind {
            CallKind::Rpc => Self::PreRpc,
            CallKind::Endpoint => Self::PreEndpoint,
        }
    }

    /// The post-invocation chain for a call kind.
    #[must_use]
    pub const fn post(kind: CallKind) -> Self {
        match kind {
            CallKind::Rpc => Self::PostRpc,
            CallKind::Endpoint => Self::PostEndpoint,
        }
    }

    /// The chain run over an error before the reply decision.
    #[must_use]
    pub const fn pre_error(kind: CallKind) -> Self {
        match kind {
            CallKind::Rpc => Self::PreRpcError,
            CallKind::Endpoint => Self::PreEndpointError,
        }
    }

    /// The chain run over an error after the reply was sent.
    #[must_use]
    pub const fn post_error(kind: CallKind) -> Self {
        match kind {
            CallKind::Rpc => Self::PostRpcError,
            CallKind::Endpoint => Self::PostEndpointError,
        }
    }
}

type HookFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// A registered hook: an async `value -> value` transformer.
pub type Hook = Arc<dyn Fn(Value) -> HookFuture + Send + Sync>;

/// Per-service hook registry.
#[derive(Default)]
pub struct HookRegistry {
    chains: Mutex<HashMap<RpcHookType, Vec<Hook>>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook to the chain for `hook_type`.
    pub async fn register<F, Fut>(&self, hook_type: RpcHookType, hook: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |value| Box::pin(hook(value)));
        self.chains
            .lock()
            .await
            .entry(hook_type)
            .or_default()
            .push(hook);
    }

    /// Whether any hook is registered for `hook_type`.
    pub async fn has(&self, hook_type: RpcHookType) -> bool {
        self.chains
            .lock()
            .await
            .get(&hook_type)
            .is_some_and(|chain| !chain.is_empty())
    }

    /// Folds `value` through the chain registered for `hook_type`.
    pub async fn run(&self, hook_type: RpcHookType, value: Value) -> Result<Value, RpcError> {
        let chain = {
            let chains = self.chains.lock().await;
            chains.get(&hook_type).cloned().unwrap_or_default()
        };
        let mut value = value;
        for hook in chain {
            value = hook(value).await?;
        }
        Ok(value)
    }

    /// Drops every registered hook.
    pub async fn clear(&self) {
        self.chains.lock().await.clear();
    }
}
