//! End-to-end engine scenarios over the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use island_broker::{Channel, MemoryBroker, MemoryChannelPool, PublishOptions};
use island_proto::{CallKind, ErrorKind, ResponseEnvelope, Reviver, RpcError, TraceScope};
use island_rpc::{
    InvokeError, InvokeOptions, RpcConfig, RpcHookType, RpcOptions, RpcService, SchemaGuard,
    SchemaOptions,
};
use serde_json::{json, Value};

fn test_config() -> RpcConfig {
    RpcConfig::default()
        .with_wait_timeout(Duration::from_secs(5))
        .with_exec_timeout(Duration::from_secs(2))
}

async fn start_service(broker: &MemoryBroker, name: &str, config: RpcConfig) -> RpcService {
    let pool = Arc::new(MemoryChannelPool::new(broker.clone()));
    let service = RpcService::new(name, pool, config);
    service.listen().await.unwrap();
    service
}

fn expect_rpc(err: InvokeError) -> RpcError {
    match err {
        InvokeError::Rpc(err) => err,
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn echo_roundtrip() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "echo-svc", test_config()).await;

    service
        .register(
            "echo",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let out = service.invoke("echo", json!({"a": 1})).await.unwrap();
    assert_eq!(out, json!({"a": 1}));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(service.pending_request_count().await, 0);
}

#[tokio::test]
async fn wait_timeout_rejects_and_clears_pending() {
    let broker = MemoryBroker::new();
    let config = test_config().with_wait_timeout(Duration::from_millis(200));
    let service = start_service(&broker, "slow-svc", config).await;

    service
        .register(
            "slow",
            |_req: Value, _scope: TraceScope| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!(null))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let err = expect_rpc(service.invoke("slow", json!({})).await.unwrap_err());
    let elapsed = started.elapsed();

    assert_eq!(err.status_code, 504);
    assert_eq!(err.error_key, "F0023_RPC_TIMEOUT");
    assert!(err.message.contains("slow"));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(service.pending_request_count().await, 0);
}

#[tokio::test]
async fn logic_error_roundtrip_preserves_fields() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "bad-svc", test_config()).await;

    service
        .register(
            "bad",
            |_req: Value, _scope: TraceScope| async move {
                Err::<Value, _>(RpcError::logic(
                    island_proto::LogicCode::WrongParameterSchema,
                    "nope",
                ))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let err = expect_rpc(service.invoke("bad", json!({})).await.unwrap_err());
    assert_eq!(err.kind, ErrorKind::Logic);
    assert_eq!(err.error_key, "L0002_WRONG_PARAMETER_SCHEMA");
    assert_eq!(err.error_number, 2);
    assert_eq!(err.status_code, 400);
    assert_eq!(err.occurred_in, "bad-svc");
    assert!(!err.stack.is_empty());
    // the callee populated the debugging context before replying
    assert_eq!(err.extra["island"], "bad-svc");
    assert_eq!(err.extra["name"], "bad");
    assert!(err.extra["req"].is_string());
}

#[tokio::test]
async fn status_503_requeues_then_succeeds() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "retry-svc", test_config()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    service
        .register(
            "retry",
            move |_req: Value, _scope: TraceScope| {
                let calls = handler_calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(RpcError::etc_named("TemporarilyUnavailable", "busy")
                            .with_status(503))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let out = service.invoke("retry", json!({})).await.unwrap();
    assert_eq!(out, json!("ok"));
    // the nack is deferred so redelivery cannot hot-loop
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn input_validation_failure_is_a_logic_error() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "validate-svc", test_config()).await;

    let options = RpcOptions::with_schema(SchemaOptions {
        query: Some(SchemaGuard::default().validate(|value| {
            value.get("n").map_or(false, Value::is_i64)
        })),
        result: None,
    });
    let called = Arc::new(AtomicUsize::new(0));
    let handler_called = called.clone();
    service
        .register(
            "validate",
            move |req: Value, _scope: TraceScope| {
                handler_called.fetch_add(1, Ordering::SeqCst);
                async move { Ok(req) }
            },
            CallKind::Rpc,
            options,
        )
        .await
        .unwrap();

    let err = expect_rpc(service.invoke("validate", json!({"n": "x"})).await.unwrap_err());
    assert_eq!(err.error_key, "L0002_WRONG_PARAMETER_SCHEMA");
    assert_eq!(err.kind, ErrorKind::Logic);
    assert_eq!(called.load(Ordering::SeqCst), 0);

    let out = service.invoke("validate", json!({"n": 3})).await.unwrap();
    assert_eq!(out, json!({"n": 3}));
}

#[tokio::test]
async fn sanitization_runs_before_validation() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "sanitize-svc", test_config()).await;

    let options = RpcOptions::with_schema(SchemaOptions {
        query: Some(
            SchemaGuard::default()
                .sanitize(|value| {
                    let n = value["n"]
                        .as_str()
                        .and_then(|s| s.parse::<i64>().ok())
                        .or_else(|| value["n"].as_i64());
                    json!({ "n": n })
                })
                .validate(|value| value.get("n").map_or(false, Value::is_i64)),
        ),
        result: None,
    });
    service
        .register(
            "parse",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            options,
        )
        .await
        .unwrap();

    let out = service.invoke("parse", json!({"n": "42"})).await.unwrap();
    assert_eq!(out, json!({"n": 42}));
}

#[tokio::test]
async fn nested_invoke_inherits_tattoo() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "chain-svc", test_config()).await;

    service
        .register(
            "chain_b",
            |_req: Value, scope: TraceScope| async move { Ok(json!(scope.tattoo)) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let caller = service.clone();
    service
        .register(
            "chain_a",
            move |req: Value, scope: TraceScope| {
                let caller = caller.clone();
                async move {
                    caller
                        .invoke_scoped("chain_b", req, &scope)
                        .await
                        .map_err(RpcError::from)
                }
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let scope = TraceScope::new(Some("T-123".to_owned()), "test", CallKind::Rpc);
    let reply = service
        .invoke_with("chain_a", json!({}), InvokeOptions::scoped(&scope))
        .await
        .unwrap();
    assert_eq!(reply.body, json!("T-123"));

    // without a scope there is no tattoo to inherit
    let reply = service.invoke("chain_b", json!({})).await.unwrap();
    assert_eq!(reply, json!(null));
}

#[tokio::test]
async fn pre_hooks_fold_in_order() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "hook-svc", test_config()).await;

    for suffix in ["1", "2", "3"] {
        service
            .register_hook(RpcHookType::PreRpc, move |value: Value| async move {
                let base = value.as_str().unwrap_or_default().to_owned();
                Ok(Value::String(format!("{base}{suffix}")))
            })
            .await;
    }
    service
        .register(
            "echo",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let out = service.invoke("echo", json!("x")).await.unwrap();
    assert_eq!(out, json!("x123"));
}

#[tokio::test]
async fn endpoint_and_rpc_hook_chains_are_separate() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "kinds-svc", test_config()).await;

    service
        .register_hook(RpcHookType::PreEndpoint, |value: Value| async move {
            let base = value.as_str().unwrap_or_default().to_owned();
            Ok(Value::String(format!("{base}-endpoint")))
        })
        .await;
    service
        .register(
            "edge",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Endpoint,
            RpcOptions::default(),
        )
        .await
        .unwrap();
    service
        .register(
            "internal",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        service.invoke("edge", json!("x")).await.unwrap(),
        json!("x-endpoint")
    );
    assert_eq!(service.invoke("internal", json!("x")).await.unwrap(), json!("x"));
}

#[tokio::test]
async fn purge_resets_hooks_but_keeps_consumers() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "purge-svc", test_config()).await;

    service
        .register_hook(RpcHookType::PreRpc, |_value: Value| async move {
            Err::<Value, _>(RpcError::etc_named("HookReject", "blocked"))
        })
        .await;
    service
        .register(
            "echo",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let err = expect_rpc(service.invoke("echo", json!(1)).await.unwrap_err());
    assert_eq!(err.kind, ErrorKind::Etc);

    service.purge().await;
    assert_eq!(service.invoke("echo", json!(1)).await.unwrap(), json!(1));
}

#[tokio::test]
async fn exec_timeout_is_fatal() {
    let broker = MemoryBroker::new();
    let config = test_config().with_exec_timeout(Duration::from_millis(100));
    let service = start_service(&broker, "overrun-svc", config).await;

    service
        .register(
            "overrun",
            |_req: Value, _scope: TraceScope| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let err = expect_rpc(service.invoke("overrun", json!({})).await.unwrap_err());
    assert_eq!(err.kind, ErrorKind::Fatal);
    assert_eq!(err.error_key, "F0024_RPC_EXEC_TIMEOUT");
    assert_eq!(err.status_code, 500);
}

#[tokio::test]
async fn late_reply_is_dropped() {
    let broker = MemoryBroker::new();
    let config = test_config().with_wait_timeout(Duration::from_millis(150));
    let service = start_service(&broker, "late-svc", config).await;

    service
        .register(
            "late",
            |_req: Value, _scope: TraceScope| async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(json!("late"))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();
    service
        .register(
            "fast",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let err = expect_rpc(service.invoke("late", json!({})).await.unwrap_err());
    assert_eq!(err.error_key, "F0023_RPC_TIMEOUT");

    // the late reply lands on the response queue and is dropped silently
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(service.pending_request_count().await, 0);
    assert_eq!(service.invoke("fast", json!(7)).await.unwrap(), json!(7));
}

#[tokio::test]
async fn invoke_to_unknown_procedure_times_out() {
    let broker = MemoryBroker::new();
    let config = test_config().with_wait_timeout(Duration::from_millis(150));
    let service = start_service(&broker, "lonely-svc", config).await;

    let err = expect_rpc(service.invoke("missing", json!({})).await.unwrap_err());
    assert_eq!(err.error_key, "F0023_RPC_TIMEOUT");
    assert_eq!(service.pending_request_count().await, 0);
}

#[tokio::test]
async fn with_raw_returns_reply_payload() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "raw-svc", test_config()).await;

    service
        .register(
            "echo",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let reply = service
        .invoke_with("echo", json!({"a": 1}), InvokeOptions::default().with_raw())
        .await
        .unwrap();
    assert_eq!(reply.body, json!({"a": 1}));

    let raw = reply.raw.expect("raw payload requested");
    let envelope: ResponseEnvelope = serde_json::from_slice(&raw).unwrap();
    assert!(envelope.result);
    assert!(envelope.is_current());
}

#[tokio::test]
async fn request_without_reply_to_is_discarded() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "strict-svc", test_config()).await;

    let called = Arc::new(AtomicUsize::new(0));
    let handler_called = called.clone();
    service
        .register(
            "strict",
            move |req: Value, _scope: TraceScope| {
                handler_called.fetch_add(1, Ordering::SeqCst);
                async move { Ok(req) }
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    // a raw publish without replyTo is a caller-side programming error
    let channel = broker.channel();
    channel
        .send_to_queue("strict", b"{}", PublishOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(broker.queue_depth("strict").await, Some(0));

    // the consumer is still healthy afterwards
    assert_eq!(service.invoke("strict", json!(1)).await.unwrap(), json!(1));
}

#[tokio::test]
async fn pause_resume_and_unregister() {
    let broker = MemoryBroker::new();
    let config = test_config().with_wait_timeout(Duration::from_millis(300));
    let service = start_service(&broker, "lifecycle-svc", config).await;

    service
        .register(
            "work",
            |req: Value, _scope: TraceScope| async move { Ok(req) },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(service.invoke("work", json!(1)).await.unwrap(), json!(1));

    service.pause("work").await.unwrap();
    let err = expect_rpc(service.invoke("work", json!(2)).await.unwrap_err());
    assert_eq!(err.error_key, "F0023_RPC_TIMEOUT");

    service.resume("work").await.unwrap();
    assert_eq!(service.invoke("work", json!(3)).await.unwrap(), json!(3));

    service.unregister("work").await.unwrap();
    let err = expect_rpc(service.invoke("work", json!(4)).await.unwrap_err());
    assert_eq!(err.error_key, "F0023_RPC_TIMEOUT");

    assert!(matches!(
        service.pause("work").await,
        Err(island_rpc::RpcServiceError::UnknownConsumer(_))
    ));
}

#[tokio::test]
async fn reviver_rehydrates_reply_values() {
    let broker = MemoryBroker::new();
    let service = start_service(&broker, "reviver-svc", test_config()).await;

    service
        .register(
            "dates",
            |_req: Value, _scope: TraceScope| async move {
                Ok(json!({"when": "2024-01-01"}))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let reviver: Reviver = Arc::new(|key, value| {
        if key == "when" {
            if let Value::String(s) = &value {
                return Value::String(format!("date:{s}"));
            }
        }
        value
    });
    service.set_reviver(reviver);

    let out = service.invoke("dates", json!({})).await.unwrap();
    assert_eq!(out["when"], "date:2024-01-01");
}

#[tokio::test]
async fn no_reviver_option_disables_rehydration() {
    let broker = MemoryBroker::new();
    let service =
        start_service(&broker, "plain-svc", test_config().without_reviver()).await;

    service
        .register(
            "dates",
            |_req: Value, _scope: TraceScope| async move {
                Ok(json!({"when": "2024-01-01"}))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let reviver: Reviver = Arc::new(|_key, _value| json!("clobbered"));
    service.set_reviver(reviver);

    let out = service.invoke("dates", json!({})).await.unwrap();
    assert_eq!(out, json!({"when": "2024-01-01"}));
}

#[tokio::test]
async fn two_services_call_each_other() {
    let broker = MemoryBroker::new();
    let accounts = start_service(&broker, "accounts", test_config()).await;
    let billing = start_service(&broker, "billing", test_config()).await;

    billing
        .register(
            "charge",
            |req: Value, _scope: TraceScope| async move {
                Ok(json!({"charged": req["amount"]}))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();

    let out = accounts.invoke("charge", json!({"amount": 50})).await.unwrap();
    assert_eq!(out, json!({"charged": 50}));

    // the failure stamp names the service where the error occurred
    billing
        .register(
            "refuse",
            |_req: Value, _scope: TraceScope| async move {
                Err::<Value, _>(RpcError::logic(
                    island_proto::LogicCode::WrongParameterSchema,
                    "refused",
                ))
            },
            CallKind::Rpc,
            RpcOptions::default(),
        )
        .await
        .unwrap();
    let err = expect_rpc(accounts.invoke("refuse", json!({})).await.unwrap_err());
    assert_eq!(err.occurred_in, "billing");
}
