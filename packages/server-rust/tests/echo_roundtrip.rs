//! End-to-end echo over the in-memory bus: dispatcher start, stub
//! subscription, session call, reply on the bus, stop.

use std::sync::Arc;
use std::time::Duration;

use busrpc_core::{CallContext, CallEnvelope, ConnectionSettings, HandlerSettings, Reply, ServiceDescriptor};
use busrpc_server::{
    handler_fn, CallError, Dispatcher, DispatcherConfig, HandlerConfig, HandlerErrorPolicy,
    InMemoryBus, MethodTableService, RpcClient, ServiceRegistry, SessionState,
};
use serde_json::{json, Value};

fn echo_registry() -> Arc<ServiceRegistry> {
    let registry = ServiceRegistry::new();
    registry.register(MethodTableService::new(
        ServiceDescriptor::new("echo", "EchoService"),
        ["Echo", "Fail"],
    ));
    Arc::new(registry)
}

fn echo_handler() -> HandlerConfig {
    HandlerConfig::new(
        HandlerSettings::new("echo.proto").with_service("EchoService"),
        handler_fn(|call: CallEnvelope| async move {
            if call.method == "Fail" {
                anyhow::bail!("refusing {}", call.method);
            }
            Ok(Reply::ok(Value::Object(call.payload)))
        }),
    )
}

async fn started(bus: &InMemoryBus, config: DispatcherConfig) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(
        ConnectionSettings::with_urls(["memory://local"]),
        echo_registry(),
        Arc::new(bus.clone()),
        config,
    );
    dispatcher.initialize(vec![echo_handler()]).unwrap();
    dispatcher.start().await.unwrap();
    dispatcher
}

#[tokio::test]
async fn echo_through_session_handle() {
    let bus = InMemoryBus::new();
    let dispatcher = started(&bus, DispatcherConfig::default()).await;
    let session = dispatcher.session_handle(0).unwrap();
    assert_eq!(session.state(), SessionState::Running);

    let Value::Object(payload) = json!({"msg": "hi"}) else {
        unreachable!()
    };
    let reply = session
        .call("Echo", "EchoService", CallContext::default(), payload)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"code": 0, "data": {"msg": "hi"}}));

    dispatcher.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn echo_over_the_bus() {
    let bus = InMemoryBus::new();
    let dispatcher = started(&bus, DispatcherConfig::default()).await;
    let client = RpcClient::new(bus.connection(), Duration::from_secs(2));
    let descriptor = ServiceDescriptor::new("echo", "EchoService");

    let reply = client
        .call(&descriptor, "Echo", &json!({"msg": "hi"}))
        .await
        .unwrap();
    assert_eq!(reply, Reply::ok(json!({"msg": "hi"})));

    let failure = client.call(&descriptor, "Fail", &json!({})).await.unwrap();
    assert_eq!(failure.code, 500);
    assert_eq!(failure.data, Some(json!({"error": "refusing Fail"})));

    dispatcher.stop().await.unwrap();
    assert!(client.call(&descriptor, "Echo", &json!({})).await.is_err());
}

#[tokio::test]
async fn dropped_failure_leaves_caller_waiting() {
    let bus = InMemoryBus::new();
    let config = DispatcherConfig {
        call_timeout: Duration::from_millis(100),
        handler_error_policy: HandlerErrorPolicy::Drop,
        ..DispatcherConfig::default()
    };
    let dispatcher = started(&bus, config).await;
    let session = dispatcher.session_handle(0).unwrap();

    let err = session
        .call("Fail", "EchoService", CallContext::default(), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout { timeout_ms: 100 });

    let client = RpcClient::new(bus.connection(), Duration::from_millis(300));
    let outcome = client
        .call(&ServiceDescriptor::new("echo", "EchoService"), "Fail", &json!({}))
        .await;
    assert!(outcome.is_err(), "no reply is published under the drop policy");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_bus_callers_each_get_their_reply() {
    let bus = InMemoryBus::new();
    let config = DispatcherConfig {
        max_concurrent_calls: 8,
        ..DispatcherConfig::default()
    };
    let dispatcher = started(&bus, config).await;
    let descriptor = ServiceDescriptor::new("echo", "EchoService");

    let mut calls = tokio::task::JoinSet::new();
    for i in 0..16 {
        let client = RpcClient::new(bus.connection(), Duration::from_secs(2));
        let descriptor = descriptor.clone();
        calls.spawn(async move {
            let reply = client.call(&descriptor, "Echo", &json!({ "n": i })).await.unwrap();
            assert_eq!(reply.data, Some(json!({ "n": i })));
        });
    }
    while let Some(result) = calls.join_next().await {
        result.unwrap();
    }

    dispatcher.stop().await.unwrap();
}
