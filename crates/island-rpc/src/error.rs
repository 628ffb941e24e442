//! Engine-level error types.

use island_broker::BrokerError;
use island_proto::RpcError;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by registration and lifecycle operations.
#[derive(Debug, Error)]
pub enum RpcServiceError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("no consumer registered for '{0}'")]
    UnknownConsumer(String),
}

/// Error returned by `invoke`.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// A typed wire error: the callee failed, the reply was undecodable or
    /// the wait timeout fired.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The request never left the process: the broker refused the publish.
    /// Carries the tattoo that was in scope when the call was issued.
    #[error("publish failed: {source}")]
    Publish {
        #[source]
        source: BrokerError,
        tattoo: Option<String>,
    },
}

impl InvokeError {
    /// The wire error, when this failure carries one.
    #[must_use]
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(err) => Some(err),
            Self::Publish { .. } => None,
        }
    }
}

impl From<InvokeError> for RpcError {
    /// Lets handlers propagate nested `invoke` failures with `?`. Publish
    /// failures become ETC errors with the tattoo preserved in `extra`.
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::Rpc(err) => err,
            InvokeError::Publish { source, tattoo } => {
                let err = RpcError::etc_named("BrokerError", source.to_string());
                match tattoo {
                    Some(tattoo) => err.with_extra(json!({ "tattoo": tattoo })),
                    None => err,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use island_proto::{ErrorKind, FatalCode};

    #[test]
    fn rpc_variant_passes_through() {
        let err = InvokeError::from(RpcError::fatal(FatalCode::RpcTimeout, "slow"));
        assert_eq!(err.rpc().map(|e| e.status_code), Some(504));
        let back: RpcError = err.into();
        assert_eq!(back.error_key, "F0023_RPC_TIMEOUT");
    }

    #[test]
    fn publish_failure_keeps_tattoo() {
        let err = InvokeError::Publish {
            source: BrokerError::ChannelClosed,
            tattoo: Some("t-42".to_owned()),
        };
        assert!(err.rpc().is_none());
        let rpc: RpcError = err.into();
        assert_eq!(rpc.kind, ErrorKind::Etc);
        assert_eq!(rpc.extra["tattoo"], "t-42");
    }
}
