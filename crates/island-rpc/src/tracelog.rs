//! Per-invocation trace log.
//!
//! Collects the facts of one handler invocation (who called, how big the
//! payload was, how long it took, how it ended) and emits a single
//! structured event when the invocation completes, whatever the outcome.

use std::time::Instant;

use island_proto::{CallKind, Origin, RpcError};
use tracing::{error, info};

pub struct TraceLog {
    tattoo: Option<String>,
    context: String,
    island: String,
    kind: CallKind,
    from_node: Option<String>,
    from_island: Option<String>,
    sent_at: Option<u64>,
    payload_bytes: usize,
    started: Instant,
    failure: Option<String>,
}

impl TraceLog {
    /// Opens the log for an inbound request.
    #[must_use]
    pub fn begin(
        tattoo: Option<String>,
        context: impl Into<String>,
        island: impl Into<String>,
        kind: CallKind,
        from: Option<&Origin>,
        sent_at: Option<u64>,
        payload_bytes: usize,
    ) -> Self {
        Self {
            tattoo,
            context: context.into(),
            island: island.into(),
            kind,
            from_node: from.map(|f| f.node.clone()),
            from_island: from.map(|f| f.island.clone()),
            sent_at,
            payload_bytes,
            started: Instant::now(),
            failure: None,
        }
    }

    /// Marks the invocation as failed.
    pub fn fail(&mut self, error: &RpcError) {
        self.failure = Some(error.to_string());
    }

    /// Emits the completed log.
    pub fn emit(self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &self.failure {
            Some(failure) => error!(
                tattoo = ?self.tattoo,
                context = %self.context,
                island = %self.island,
                kind = %self.kind,
                from_node = ?self.from_node,
                from_island = ?self.from_island,
                sent_at = ?self.sent_at,
                payload_bytes = self.payload_bytes,
                elapsed_ms,
                %failure,
                "rpc handled with error"
            ),
            None => info!(
                tattoo = ?self.tattoo,
                context = %self.context,
                island = %self.island,
                kind = %self.kind,
                from_node = ?self.from_node,
                from_island = ?self.from_island,
                sent_at = ?self.sent_at,
                payload_bytes = self.payload_bytes,
                elapsed_ms,
                "rpc handled"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use island_proto::{FatalCode, RpcError};

    #[test]
    fn emit_consumes_in_both_outcomes() {
        let ok = TraceLog::begin(
            Some("t-1".to_owned()),
            "echo",
            "svc",
            CallKind::Rpc,
            None,
            None,
            12,
        );
        ok.emit();

        let mut failed = TraceLog::begin(None, "echo", "svc", CallKind::Rpc, None, None, 12);
        failed.fail(&RpcError::fatal(FatalCode::RpcExecTimeout, "overran"));
        failed.emit();
    }
}
