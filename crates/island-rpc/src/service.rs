//! The RPC engine.
//!
//! One [`RpcService`] per deployed service instance. It owns a private
//! exclusive reply queue and multiplexes inbound replies onto waiting
//! callers by correlation id; registers named handlers behind a pipeline of
//! schema guards, hooks and an execution timeout; and wraps every consumer
//! in a uniform ack/nack envelope so failures reach the caller as typed
//! errors instead of silence.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use island_broker::{
    unix_millis_now, BrokerError, Channel, ChannelPool, Delivery, PublishOptions, QueueOptions,
    Subscription,
};
use island_proto::{
    decode_response, encode_response, CallKind, ErrorShape, FatalCode, LogicCode, MessageHeaders,
    Origin, Reviver, RpcError, TraceScope,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::error::{InvokeError, RpcServiceError};
use crate::hooks::{HookRegistry, RpcHookType};
use crate::options::{InvokeOptions, InvokeReply, RpcOptions};
use crate::tracelog::TraceLog;

/// Delay before nacking a 503 failure, so broker-level retries do not
/// hot-loop.
const REQUEUE_NACK_DELAY: Duration = Duration::from_secs(1);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// A registered procedure handler.
pub type Handler = Arc<dyn Fn(Value, TraceScope) -> HandlerFuture + Send + Sync>;

/// Failure handed from the registered wrapper to the consume envelope.
struct ConsumeFailure {
    error: RpcError,
    /// Whether the wrapper already sent an error reply; the envelope only
    /// sends its last-resort reply when it did not.
    reply_sent: bool,
}

type ConsumeFuture = Pin<Box<dyn Future<Output = Result<(), ConsumeFailure>> + Send>>;
type ConsumeHandler = Arc<dyn Fn(Delivery) -> ConsumeFuture + Send + Sync>;

/// One live procedure consumer.
struct ConsumerRecord {
    channel: Arc<dyn Channel>,
    tag: String,
    queue: String,
    handler: ConsumeHandler,
}

struct ServiceInner {
    service_name: String,
    node: String,
    response_queue: String,
    pool: Arc<dyn ChannelPool>,
    config: RpcConfig,
    hooks: HookRegistry,
    /// Pending reply slots keyed by correlation id. A slot is installed
    /// before its request is published and removed exactly once, by
    /// whichever of {reply, wait timeout, publish failure} happens first.
    waiting: Mutex<HashMap<String, oneshot::Sender<Delivery>>>,
    consumers: Mutex<HashMap<String, ConsumerRecord>>,
    response_consumer: Mutex<Option<(Arc<dyn Channel>, String)>>,
    reviver: RwLock<Option<Reviver>>,
}

/// A service instance on the broker. Cloning yields a handle to the same
/// instance.
#[derive(Clone)]
pub struct RpcService {
    inner: Arc<ServiceInner>,
}

impl RpcService {
    /// Creates a service instance. Call [`listen`](Self::listen) before
    /// issuing requests.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        pool: Arc<dyn ChannelPool>,
        config: RpcConfig,
    ) -> Self {
        let service_name = service_name.into();
        let node = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
        let response_queue = format!("rpc.res.{service_name}.{node}.{}", Uuid::new_v4());
        Self {
            inner: Arc::new(ServiceInner {
                service_name,
                node,
                response_queue,
                pool,
                config,
                hooks: HookRegistry::new(),
                waiting: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                response_consumer: Mutex::new(None),
                reviver: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// The private reply queue name, unique per process instance.
    #[must_use]
    pub fn response_queue(&self) -> &str {
        &self.inner.response_queue
    }

    /// Installs the decode-time reviver applied to reply bodies. Has no
    /// effect when the instance was configured with `no_reviver`.
    pub fn set_reviver(&self, reviver: Reviver) {
        match self.inner.reviver.write() {
            Ok(mut slot) => *slot = Some(reviver),
            Err(poisoned) => *poisoned.into_inner() = Some(reviver),
        }
    }

    fn reviver_for_decode(&self) -> Option<Reviver> {
        if self.inner.config.no_reviver {
            return None;
        }
        match self.inner.reviver.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Declares the private reply queue and starts the response
    /// multiplexer: every inbound reply is acked unconditionally and routed
    /// to the waiting caller by correlation id; replies for unknown ids are
    /// logged and dropped.
    pub async fn listen(&self) -> Result<(), RpcServiceError> {
        let channel = self.inner.pool.acquire().await?;
        channel
            .assert_queue(&self.inner.response_queue, QueueOptions::exclusive())
            .await?;
        channel.prefetch(self.inner.config.prefetch).await?;
        let Subscription {
            tag,
            mut deliveries,
        } = channel.consume(&self.inner.response_queue).await?;

        let inner = self.inner.clone();
        let mux_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let _ = mux_channel.ack(delivery.delivery_tag).await;
                let Some(correlation_id) = delivery.correlation_id.clone() else {
                    debug!("reply without correlation id dropped");
                    continue;
                };
                let slot = inner.waiting.lock().await.remove(&correlation_id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(delivery);
                    }
                    None => {
                        debug!(%correlation_id, "reply for unknown correlation id dropped");
                    }
                }
            }
        });

        *self.inner.response_consumer.lock().await = Some((channel, tag));
        Ok(())
    }

    /// Stops the response multiplexer and releases its channel.
    pub async fn unlisten(&self) -> Result<(), RpcServiceError> {
        if let Some((channel, tag)) = self.inner.response_consumer.lock().await.take() {
            let result = channel.cancel(&tag).await;
            self.inner.pool.release(channel).await;
            result?;
        }
        Ok(())
    }

    /// Invokes procedure `name` without a trace scope and returns the reply
    /// body.
    pub async fn invoke(&self, name: &str, msg: Value) -> Result<Value, InvokeError> {
        self.invoke_with(name, msg, InvokeOptions::default())
            .await
            .map(|reply| reply.body)
    }

    /// Invokes procedure `name` inside `scope`; the outbound request
    /// inherits the scope's tattoo.
    pub async fn invoke_scoped(
        &self,
        name: &str,
        msg: Value,
        scope: &TraceScope,
    ) -> Result<Value, InvokeError> {
        self.invoke_with(name, msg, InvokeOptions::scoped(scope))
            .await
            .map(|reply| reply.body)
    }

    /// Invokes procedure `name`.
    ///
    /// The reply slot is installed before the request is published, so no
    /// reply can race ahead of it. The wait timer, a late reply and a
    /// publish failure all tear the slot down exactly once.
    ///
    /// # Errors
    ///
    /// [`InvokeError::Publish`] when the broker refuses the publish;
    /// [`InvokeError::Rpc`] with `F0023_RPC_TIMEOUT` when no reply arrives
    /// within the wait timeout, or carrying the callee's rehydrated error.
    pub async fn invoke_with(
        &self,
        name: &str,
        msg: Value,
        options: InvokeOptions,
    ) -> Result<InvokeReply, InvokeError> {
        let inner = &self.inner;
        let tattoo = options.scope.as_ref().and_then(|s| s.tattoo.clone());
        let correlation_id = Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel();
        inner
            .waiting
            .lock()
            .await
            .insert(correlation_id.clone(), tx);

        let headers = MessageHeaders {
            tattoo: tattoo.clone(),
            from: Some(Origin {
                node: inner.node.clone(),
                context: options.scope.as_ref().map(|s| s.context.clone()),
                island: inner.service_name.clone(),
                kind: options.scope.as_ref().map(|s| s.kind),
            }),
        };
        let body = serde_json::to_vec(&msg).unwrap_or_else(|_| b"null".to_vec());
        let publish_options = PublishOptions::default()
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(inner.response_queue.clone())
            .with_expiration(inner.config.wait_timeout)
            .with_timestamp(unix_millis_now())
            .with_headers(headers);

        let published = async {
            let channel = inner.pool.acquire().await?;
            let result = channel.send_to_queue(name, &body, publish_options).await;
            inner.pool.release(channel).await;
            result
        }
        .await;

        if let Err(source) = published {
            inner.waiting.lock().await.remove(&correlation_id);
            return Err(InvokeError::Publish { source, tattoo });
        }

        match timeout(inner.config.wait_timeout, rx).await {
            Err(_) => {
                inner.waiting.lock().await.remove(&correlation_id);
                Err(InvokeError::Rpc(RpcError::fatal(
                    FatalCode::RpcTimeout,
                    format!(
                        "RPC call to '{name}' timed out after {}ms",
                        inner.config.wait_timeout.as_millis()
                    ),
                )))
            }
            Ok(Err(_)) => {
                inner.waiting.lock().await.remove(&correlation_id);
                Err(InvokeError::Rpc(RpcError::etc_named(
                    "ChannelDropped",
                    format!("reply slot for '{name}' was dropped before completion"),
                )))
            }
            Ok(Ok(delivery)) => {
                let reviver = self.reviver_for_decode();
                let decoded = decode_response(&delivery.body, reviver.as_ref());
                match decoded.outcome {
                    Ok(reply_body) => Ok(InvokeReply {
                        body: reply_body,
                        raw: options.with_raw.then(|| delivery.body.clone()),
                    }),
                    Err(err) => Err(InvokeError::Rpc(err)),
                }
            }
        }
    }

    /// Registers `handler` for procedure `name` and starts consuming its
    /// queue.
    ///
    /// The queue is declared non-durable with a server-side expiry of
    /// wait timeout + service load time, so orphaned queues disappear after
    /// every consumer detaches.
    pub async fn register<F, Fut>(
        &self,
        name: &str,
        handler: F,
        kind: CallKind,
        options: RpcOptions,
    ) -> Result<(), RpcServiceError>
    where
        F: Fn(Value, TraceScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |value, scope| Box::pin(handler(value, scope)));
        let channel = self.inner.pool.acquire().await?;
        channel
            .assert_queue(
                name,
                QueueOptions::expiring(self.inner.config.queue_expires()),
            )
            .await?;
        let wrapper = self.message_wrapper(name, handler, kind, options);
        let record = self.consume_queue(channel, name, wrapper).await?;
        self.inner
            .consumers
            .lock()
            .await
            .insert(name.to_owned(), record);
        Ok(())
    }

    /// Appends a hook to the chain for `hook_type`.
    pub async fn register_hook<F, Fut>(&self, hook_type: RpcHookType, hook: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.inner.hooks.register(hook_type, hook).await;
    }

    /// Folds `value` through the chain registered for `hook_type`.
    pub async fn do_hook(&self, hook_type: RpcHookType, value: Value) -> Result<Value, RpcError> {
        self.inner.hooks.run(hook_type, value).await
    }

    /// Resets every registered hook, for test isolation. Live consumers
    /// keep running; stop them with [`unregister`](Self::unregister) and
    /// [`unlisten`](Self::unlisten).
    pub async fn purge(&self) {
        self.inner.hooks.clear().await;
    }

    /// Cancels dispatch for `name`, keeping the registration and its
    /// channel for a later [`resume`](Self::resume).
    pub async fn pause(&self, name: &str) -> Result<(), RpcServiceError> {
        let consumers = self.inner.consumers.lock().await;
        let record = consumers
            .get(name)
            .ok_or_else(|| RpcServiceError::UnknownConsumer(name.to_owned()))?;
        record.channel.cancel(&record.tag).await?;
        Ok(())
    }

    /// Re-subscribes a paused consumer with its saved handler.
    pub async fn resume(&self, name: &str) -> Result<(), RpcServiceError> {
        let mut consumers = self.inner.consumers.lock().await;
        let record = consumers
            .get_mut(name)
            .ok_or_else(|| RpcServiceError::UnknownConsumer(name.to_owned()))?;
        let refreshed = self
            .consume_queue(record.channel.clone(), &record.queue, record.handler.clone())
            .await?;
        *record = refreshed;
        Ok(())
    }

    /// Cancels the consumer for `name`, returns its channel to the pool and
    /// drops the registration.
    pub async fn unregister(&self, name: &str) -> Result<(), RpcServiceError> {
        let record = self
            .inner
            .consumers
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| RpcServiceError::UnknownConsumer(name.to_owned()))?;
        let result = record.channel.cancel(&record.tag).await;
        self.inner.pool.release(record.channel).await;
        match result {
            // a paused consumer has no tag at the broker any more
            Ok(()) | Err(BrokerError::ConsumerNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Number of requests currently awaiting replies.
    pub async fn pending_request_count(&self) -> usize {
        self.inner.waiting.lock().await.len()
    }

    fn message_wrapper(
        &self,
        name: &str,
        handler: Handler,
        kind: CallKind,
        options: RpcOptions,
    ) -> ConsumeHandler {
        let inner = self.inner.clone();
        let name = name.to_owned();
        Arc::new(move |delivery| {
            let inner = inner.clone();
            let name = name.clone();
            let handler = handler.clone();
            let options = options.clone();
            Box::pin(async move { handle_message(inner, name, handler, kind, options, delivery).await })
        })
    }

    /// Wraps a raw consumer with the uniform ack/nack policy: ack on
    /// success; delayed nack-requeue on a 503 failure; ack-and-report for
    /// anything else, so the caller observes a typed error rather than a
    /// wait timeout.
    async fn consume_queue(
        &self,
        channel: Arc<dyn Channel>,
        queue: &str,
        handler: ConsumeHandler,
    ) -> Result<ConsumerRecord, BrokerError> {
        channel.prefetch(self.inner.config.prefetch).await?;
        let Subscription {
            tag,
            mut deliveries,
        } = channel.consume(queue).await?;

        let inner = self.inner.clone();
        let task_channel = channel.clone();
        let task_handler = handler.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let inner = inner.clone();
                let channel = task_channel.clone();
                let handler = task_handler.clone();
                tokio::spawn(async move {
                    let delivery_tag = delivery.delivery_tag;
                    let reply_to = delivery.reply_to.clone();
                    let correlation_id = delivery.correlation_id.clone();
                    let headers = delivery.headers.clone();
                    match handler(delivery).await {
                        Ok(()) => {
                            let _ = channel.ack(delivery_tag).await;
                        }
                        Err(failure) if failure.error.status_code == 503 => {
                            tokio::time::sleep(REQUEUE_NACK_DELAY).await;
                            if let Err(err) = channel.nack(delivery_tag, true).await {
                                warn!(%err, "requeue nack failed");
                            }
                        }
                        Err(failure) => {
                            let _ = channel.ack(delivery_tag).await;
                            if !failure.reply_sent {
                                if let Some(reply_to) = reply_to {
                                    let payload =
                                        encode_response(Err(&failure.error), &inner.service_name);
                                    if let Err(err) = send_reply(
                                        &inner,
                                        &reply_to,
                                        &payload,
                                        correlation_id,
                                        headers,
                                    )
                                    .await
                                    {
                                        warn!(%err, "last-resort error reply failed");
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(ConsumerRecord {
            channel,
            tag,
            queue: queue.to_owned(),
            handler,
        })
    }
}

impl std::fmt::Debug for RpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcService")
            .field("service_name", &self.inner.service_name)
            .field("response_queue", &self.inner.response_queue)
            .finish_non_exhaustive()
    }
}

/// The registered per-message flow: header validation, trace log, scope
/// entry, guards, hooks, handler, reply.
async fn handle_message(
    inner: Arc<ServiceInner>,
    name: String,
    handler: Handler,
    kind: CallKind,
    options: RpcOptions,
    delivery: Delivery,
) -> Result<(), ConsumeFailure> {
    // A request we cannot answer is a caller-side programming error; the
    // envelope discards it without requeueing.
    let Some(reply_to) = delivery.reply_to.clone() else {
        let err = RpcError::fatal(
            FatalCode::MissingReplyTo,
            format!("request for '{name}' carries no replyTo"),
        );
        error!(procedure = %name, %err, "discarding unanswerable request");
        return Err(ConsumeFailure {
            error: err,
            reply_sent: false,
        });
    };

    let mut tlog = TraceLog::begin(
        delivery.headers.tattoo.clone(),
        name.clone(),
        inner.service_name.clone(),
        kind,
        delivery.headers.from.as_ref(),
        delivery.timestamp,
        delivery.body.len(),
    );
    let scope = TraceScope::new(delivery.headers.tattoo.clone(), name.clone(), kind);

    match run_handler(&inner, &name, &handler, kind, &options, &scope, &delivery.body).await {
        Ok(body) => {
            let payload = encode_response(Ok(&body), &inner.service_name);
            let sent = send_reply(
                &inner,
                &reply_to,
                &payload,
                delivery.correlation_id.clone(),
                delivery.headers.clone(),
            )
            .await;
            if let Err(err) = sent {
                warn!(procedure = %name, %err, "reply publish failed");
            }
            tlog.emit();
            Ok(())
        }
        Err(err) => {
            let err = transform_error(&inner.hooks, RpcHookType::pre_error(kind), err).await;
            tlog.fail(&err);

            // 503 means "retry later": suppress the reply so the envelope
            // can nack-with-delay for broker-level redelivery.
            if err.status_code == 503 {
                tlog.emit();
                return Err(ConsumeFailure {
                    error: err,
                    reply_sent: false,
                });
            }

            let mut err = err;
            ensure_extra(&mut err, &inner.service_name, &name, &delivery.body);
            error!(procedure = %name, %err, "rpc handler failed");
            let payload = encode_response(Err(&err), &inner.service_name);
            let reply_sent = send_reply(
                &inner,
                &reply_to,
                &payload,
                delivery.correlation_id.clone(),
                delivery.headers.clone(),
            )
            .await
            .is_ok();
            let err = transform_error(&inner.hooks, RpcHookType::post_error(kind), err).await;
            tlog.emit();
            Err(ConsumeFailure {
                error: err,
                reply_sent,
            })
        }
    }
}

/// Decode and input guards, then hooks + handler + output guards under the
/// execution timeout.
async fn run_handler(
    inner: &Arc<ServiceInner>,
    name: &str,
    handler: &Handler,
    kind: CallKind,
    options: &RpcOptions,
    scope: &TraceScope,
    body: &[u8],
) -> Result<Value, RpcError> {
    let mut request: Value = serde_json::from_slice(body).map_err(|err| {
        RpcError::etc_named(
            "SyntaxError",
            format!("request payload could not be parsed: {err}"),
        )
    })?;

    if let Some(guard) = options.schema.as_ref().and_then(|s| s.query.as_ref()) {
        if let Some(sanitize) = &guard.sanitization {
            request = sanitize(request);
        }
        if let Some(validate) = &guard.validation {
            if !validate(&request) {
                return Err(RpcError::logic(
                    LogicCode::WrongParameterSchema,
                    format!("request for '{name}' failed schema validation"),
                ));
            }
        }
    }

    let result_guard = options.schema.as_ref().and_then(|s| s.result.clone());
    let hooks = &inner.hooks;
    let work = async {
        let request = hooks.run(RpcHookType::pre(kind), request).await?;
        let mut result = handler(request, scope.clone()).await?;
        result = hooks.run(RpcHookType::post(kind), result).await?;
        if let Some(guard) = &result_guard {
            if let Some(sanitize) = &guard.sanitization {
                result = sanitize(result);
            }
            if let Some(validate) = &guard.validation {
                if !validate(&result) {
                    return Err(RpcError::logic(
                        LogicCode::WrongParameterSchema,
                        format!("response from '{name}' failed schema validation"),
                    ));
                }
            }
        }
        Ok(result)
    };

    match timeout(inner.config.exec_timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::fatal(
            FatalCode::RpcExecTimeout,
            format!(
                "handler for '{name}' exceeded {}ms execution timeout",
                inner.config.exec_timeout.as_millis()
            ),
        )),
    }
}

/// Runs an error hook chain over the wire form of `error`. A failing or
/// malformed transformation keeps the original error.
async fn transform_error(
    hooks: &HookRegistry,
    hook_type: RpcHookType,
    error: RpcError,
) -> RpcError {
    if !hooks.has(hook_type).await {
        return error;
    }
    let value = match serde_json::to_value(ErrorShape::from_error(&error, "")) {
        Ok(value) => value,
        Err(_) => return error,
    };
    match hooks.run(hook_type, value).await {
        Ok(value) => match serde_json::from_value::<ErrorShape>(value) {
            Ok(shape) => shape.into_error(),
            Err(_) => error,
        },
        Err(hook_err) => {
            warn!(%hook_err, "error hook failed; keeping original error");
            error
        }
    }
}

/// Populates `extra` with the debugging context `{island, name, req}`
/// without clobbering anything a handler already put there.
fn ensure_extra(error: &mut RpcError, island: &str, name: &str, raw_request: &[u8]) {
    let req = String::from_utf8_lossy(raw_request).into_owned();
    if !error.extra.is_object() {
        error.extra = json!({ "island": island, "name": name, "req": req });
        return;
    }
    if let Some(map) = error.extra.as_object_mut() {
        map.entry("island").or_insert_with(|| json!(island));
        map.entry("name").or_insert_with(|| json!(name));
        map.entry("req").or_insert_with(|| json!(req));
    }
}

/// Publishes a reply on a short-lived pooled channel, carrying the request's
/// correlation id and headers through.
async fn send_reply(
    inner: &Arc<ServiceInner>,
    reply_to: &str,
    payload: &[u8],
    correlation_id: Option<String>,
    headers: MessageHeaders,
) -> Result<(), BrokerError> {
    let mut options = PublishOptions::default()
        .with_headers(headers)
        .with_timestamp(unix_millis_now());
    if let Some(id) = correlation_id {
        options = options.with_correlation_id(id);
    }
    let channel = inner.pool.acquire().await?;
    let result = channel.send_to_queue(reply_to, payload, options).await;
    inner.pool.release(channel).await;
    result
}
