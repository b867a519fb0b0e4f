//! Request/reply calls to remote workers over the transport
//!
//! Calls are published to `rpc_direct_exchange` with a fresh correlation ID
//! and the reply queue in `reply_to`. Workers answer with one of:
//!
//! ```json
//! {"type": "reply", "value": ...}
//! {"type": "error", "message": "...", "stack": "..."}
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::error::{RpcError, TransportError};
use crate::logger::FlowLogger;
use crate::transport::{
    Binding, Delivery, ExchangeKind, Message, MessageHandler, PublishOptions, Transport, RPC_EXCHANGE,
};

/// Pseudo-queue replies are delivered to
pub const REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

/// Body of a call message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCall {
    /// Remote function name
    pub function_name: String,
    /// Positional arguments
    pub arguments: Vec<Value>,
}

struct PendingCall {
    reply: oneshot::Sender<Result<Value, RpcError>>,
    local_trace: String,
}

type PendingCalls = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Client side of the RPC bridge
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    logger: FlowLogger,
    pending: PendingCalls,
    closed: AtomicBool,
}

impl RpcClient {
    /// Declare the RPC exchange and start consuming replies
    pub async fn new(
        transport: Arc<dyn Transport>,
        config: RpcConfig,
        logger: FlowLogger,
    ) -> Result<Self, RpcError> {
        transport.assert_exchange(RPC_EXCHANGE, ExchangeKind::Direct).await?;

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let handler: MessageHandler = {
            let pending = pending.clone();
            let logger = logger.clone();
            Arc::new(move |message: Message| {
                on_reply(&pending, &logger, message);
                async { Delivery::Ack }.boxed()
            })
        };
        transport
            .create_subscriber(handler, Binding::queue(REPLY_QUEUE), "rpc-client")
            .await?;

        Ok(Self {
            transport,
            config,
            logger,
            pending,
            closed: AtomicBool::new(false),
        })
    }

    /// Call `function` on the worker listening on `routing_key`
    ///
    /// The caller's location is kept so remote errors can show where the
    /// call was made.
    #[track_caller]
    pub fn call_function(
        &self,
        routing_key: &str,
        function: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send + '_ {
        self.call_function_at(routing_key, function, args, Location::caller())
    }

    /// `call_function` with the call site supplied by the caller
    pub(crate) fn call_function_at(
        &self,
        routing_key: &str,
        function: &str,
        args: Vec<Value>,
        caller: &'static Location<'static>,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send + '_ {
        let local_trace = format!("    at {}:{}:{}", caller.file(), caller.line(), caller.column());
        let routing_key = routing_key.to_string();
        let call = RpcCall {
            function_name: function.to_string(),
            arguments: args,
        };
        async move { self.call(routing_key, call, local_trace).await }
    }

    /// Bind `routing_key` and `function` into a reusable callable
    ///
    /// Remote errors of its calls point at the place it was declared.
    #[track_caller]
    pub fn declare_function(
        self: &Arc<Self>,
        routing_key: impl Into<String>,
        function: impl Into<String>,
    ) -> impl Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync {
        let caller = Location::caller();
        let client = self.clone();
        let routing_key = routing_key.into();
        let function = function.into();
        move |args| {
            let client = client.clone();
            let routing_key = routing_key.clone();
            let function = function.clone();
            async move {
                client
                    .call_function_at(&routing_key, &function, args, caller)
                    .await
            }
            .boxed()
        }
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending
            .lock()
            .map(|p| p.len())
            .unwrap_or_default()
    }

    /// Stop accepting calls and fail every outstanding one with `RpcError::Closed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PendingCall> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, call)| call).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, call)| call).collect(),
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Rejecting outstanding RPC calls");
        }
        for call in drained {
            let _ = call.reply.send(Err(RpcError::Closed));
        }
    }

    async fn call(&self, routing_key: String, call: RpcCall, local_trace: String) -> Result<Value, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }

        let body = serde_json::to_value(&call).map_err(|e| TransportError::InvalidState(e.to_string()))?;
        self.check_size(&call.arguments)?;

        let correlation_id = Uuid::new_v4().to_string();
        let rx = self.register(&correlation_id, local_trace)?;

        tracing::debug!(
            routing_key = %routing_key,
            function = %call.function_name,
            correlation_id = %correlation_id,
            "Calling remote function"
        );

        let published = self
            .transport
            .publish(
                RPC_EXCHANGE,
                &routing_key,
                body,
                PublishOptions::request(correlation_id.clone(), REPLY_QUEUE),
            )
            .await;
        if let Err(e) = published {
            self.forget(&correlation_id);
            return Err(e.into());
        }

        let reply = async { rx.await.unwrap_or(Err(RpcError::Closed)) };
        match self.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reply).await {
                Ok(result) => result,
                Err(_) => {
                    self.forget(&correlation_id);
                    Err(RpcError::Timeout(call.function_name))
                }
            },
            None => reply.await,
        }
    }

    /// Add an open request; fails once `close` has started
    fn register(
        &self,
        correlation_id: &str,
        local_trace: String,
    ) -> Result<oneshot::Receiver<Result<Value, RpcError>>, RpcError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;
        // `close` sets the flag before draining under this lock
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            correlation_id.to_string(),
            PendingCall {
                reply: tx,
                local_trace,
            },
        );
        Ok(rx)
    }

    fn check_size(&self, args: &[Value]) -> Result<(), RpcError> {
        if self.config.max_message_size.is_none() && self.config.warn_message_size.is_none() {
            return Ok(());
        }
        let size = serde_json::to_vec(args).map(|b| b.len()).unwrap_or(0);
        if let Some(max) = self.config.max_message_size {
            if size > max {
                return Err(RpcError::MessageTooLarge { size, max });
            }
        }
        if let Some(warn) = self.config.warn_message_size {
            if size > warn {
                self.logger
                    .warn(format!("Large RPC message size detected: {} bytes", size));
            }
        }
        Ok(())
    }

    fn forget(&self, correlation_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(correlation_id);
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("pending_calls", &self.pending_calls())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn on_reply(pending: &PendingCalls, logger: &FlowLogger, message: Message) {
    let correlation_id = message.options.correlation_id.clone().unwrap_or_default();
    let call = pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&correlation_id));

    let Some(call) = call else {
        logger.warn(format!(
            "received unexpected response correlationID: {}",
            correlation_id
        ));
        return;
    };

    let body = message.body;
    let result = match body.get("type").and_then(Value::as_str) {
        Some("reply") => Ok(body.get("value").cloned().unwrap_or(Value::Null)),
        Some("error") => Err(RpcError::Remote {
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            remote_stack: body
                .get("stack")
                .and_then(Value::as_str)
                .map(format_trace),
            local_trace: call.local_trace,
        }),
        _ => Err(RpcError::Malformed(body)),
    };
    let _ = call.reply.send(result);
}

/// Drop the first line (the error message) of a stack trace
fn format_trace(stack: &str) -> String {
    stack.lines().skip(1).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ElementMetadata;
    use crate::logger::{LogLevel, MemoryLogSink};
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    /// Worker on `routing_key` that answers with `respond(call)`
    async fn worker<F>(transport: &Arc<MemoryTransport>, routing_key: &str, respond: F)
    where
        F: Fn(RpcCall) -> Option<Value> + Send + Sync + 'static,
    {
        let replies = transport.clone();
        let respond = Arc::new(respond);
        let handler: MessageHandler = Arc::new(move |message: Message| {
            let replies = replies.clone();
            let respond = respond.clone();
            async move {
                let call: RpcCall = serde_json::from_value(message.body).unwrap();
                if let Some(reply) = respond(call) {
                    let reply_to = message.options.reply_to.unwrap();
                    let correlation_id = message.options.correlation_id.unwrap();
                    replies
                        .publish("", &reply_to, reply, PublishOptions::reply(correlation_id))
                        .await
                        .unwrap();
                }
                Delivery::Ack
            }
            .boxed()
        });
        transport
            .create_subscriber(handler, Binding::new(RPC_EXCHANGE, routing_key), "worker")
            .await
            .unwrap();
    }

    async fn client(transport: &Arc<MemoryTransport>, config: RpcConfig) -> (RpcClient, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::new());
        let logger = FlowLogger::new(ElementMetadata::new("none")).with_sink(Some(sink.clone()));
        let client = RpcClient::new(transport.clone(), config, logger).await.unwrap();
        (client, sink)
    }

    #[tokio::test]
    async fn test_reply_resolves_call() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |call| {
            Some(json!({"type": "reply", "value": {"fn": call.function_name, "args": call.arguments}}))
        })
        .await;
        let (client, _) = client(&transport, RpcConfig::new()).await;

        let value = client.call_function("key", "add", vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(value, json!({"fn": "add", "args": [1, 2]}));
        assert_eq!(client.pending_calls(), 0);

        let sent = transport.published_to(RPC_EXCHANGE);
        assert_eq!(sent[0].message, json!({"functionName": "add", "arguments": [1, 2]}));
        assert_eq!(sent[0].options.reply_to.as_deref(), Some(REPLY_QUEUE));
        assert!(sent[0].options.correlation_id.is_some());
        assert_eq!(transport.exchanges()[RPC_EXCHANGE], ExchangeKind::Direct);
    }

    #[tokio::test]
    async fn test_remote_error_carries_both_stacks() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |_| {
            Some(json!({"type": "error", "message": "boom", "stack": "Error: boom\n  at remote.py:3"}))
        })
        .await;
        let (client, _) = client(&transport, RpcConfig::new()).await;

        let err = client.call_function("key", "explode", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        let stack = err.stack().unwrap();
        assert!(stack.starts_with("Remote Stack\n  at remote.py:3\nLocal Stack\n"));
        assert!(stack.contains("rpc.rs"));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_rejected() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |_| Some(json!({"type": "weird"}))).await;
        let (client, _) = client(&transport, RpcConfig::new()).await;

        let err = client.call_function("key", "f", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Malformed(body) if body == json!({"type": "weird"})));
    }

    #[tokio::test]
    async fn test_orphan_reply_is_logged() {
        let transport = Arc::new(MemoryTransport::recording());
        let (_client, sink) = client(&transport, RpcConfig::new()).await;

        transport
            .publish("", REPLY_QUEUE, json!({"type": "reply", "value": 1}), PublishOptions::reply("nobody"))
            .await
            .unwrap();

        assert_eq!(
            sink.messages(LogLevel::Warn),
            vec!["received unexpected response correlationID: nobody"]
        );
    }

    #[tokio::test]
    async fn test_size_guards() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |_| Some(json!({"type": "reply", "value": null}))).await;
        let config = RpcConfig::new().max_message_size(64).warn_message_size(8);
        let (client, sink) = client(&transport, config).await;

        client.call_function("key", "f", vec![json!("0123456789")]).await.unwrap();
        assert_eq!(
            sink.messages(LogLevel::Warn),
            vec!["Large RPC message size detected: 14 bytes"]
        );

        let err = client
            .call_function("key", "f", vec![json!("x".repeat(100))])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { size: 104, max: 64 }));
    }

    #[tokio::test]
    async fn test_timeout_forgets_call() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |_| None).await;
        let config = RpcConfig::new().call_timeout(Duration::from_millis(20));
        let (client, _) = client(&transport, config).await;

        let err = client.call_function("key", "slow", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(name) if name == "slow"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_calls() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |_| None).await;
        let (client, _) = client(&transport, RpcConfig::new()).await;
        let client = Arc::new(client);

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call_function("key", "never", vec![]).await })
        };
        while client.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        client.close();

        assert!(matches!(call.await.unwrap(), Err(RpcError::Closed)));
        assert!(matches!(
            client.call_function("key", "late", vec![]).await,
            Err(RpcError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_register_after_close_is_rejected() {
        let transport = Arc::new(MemoryTransport::recording());
        let (client, _) = client(&transport, RpcConfig::new()).await;

        assert!(client.register("c1", String::new()).is_ok());
        client.close();
        assert!(matches!(client.register("c2", String::new()), Err(RpcError::Closed)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_declare_function() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |call| {
            Some(json!({"type": "reply", "value": call.arguments.len()}))
        })
        .await;
        let (client, _) = client(&transport, RpcConfig::new()).await;
        let count_args = Arc::new(client).declare_function("key", "count");

        assert_eq!(count_args(vec![json!(1), json!(2), json!(3)]).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_declared_function_traces_declaration_site() {
        let transport = Arc::new(MemoryTransport::recording());
        worker(&transport, "key", |_| {
            Some(json!({"type": "error", "message": "boom", "stack": "Error: boom\n  at remote.py:3"}))
        })
        .await;
        let (client, _) = client(&transport, RpcConfig::new()).await;
        let client = Arc::new(client);

        #[rustfmt::skip]
        let (line, explode) = (line!(), client.declare_function("key", "explode"));
        let err = explode(vec![]).await.unwrap_err();

        let local = format!("    at {}:{}:", file!(), line);
        assert!(err.stack().unwrap().contains(&local));
    }
}
