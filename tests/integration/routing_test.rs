//! End-to-end routing between connected applications.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;

use interop_broker::config::InvocationConfig;
use interop_broker::invocation::{
    CallTarget, ConsumedMethodReference, InvocationEngine, InvocationError,
};
use interop_broker::lifecycle::{AppLifecycleManager, LifecycleEvent};
use interop_broker::registry::{MethodType, RegistryProvider};
use interop_broker::resolver::ResolveError;

use crate::common::{
    open_stream_handler, reply_handler, transport, CONSUMER, PROVIDER, REGISTRY, SERVICE, TIMEOUT,
};

fn setup() -> (Arc<AppLifecycleManager>, Arc<InvocationEngine>) {
    let registry = Arc::new(RegistryProvider::from_document(REGISTRY.as_bytes()).unwrap());
    let lifecycle = Arc::new(AppLifecycleManager::new(registry));
    let engine = Arc::new(InvocationEngine::new(
        Arc::clone(&lifecycle),
        &InvocationConfig::default(),
    ));
    (lifecycle, engine)
}

#[tokio::test]
async fn test_consumer_unary_call_reaches_provider() {
    let (lifecycle, engine) = setup();
    let provider = lifecycle
        .on_connect(PROVIDER, transport(reply_handler()))
        .await
        .unwrap();
    let consumer = lifecycle
        .on_connect(CONSUMER, transport(reply_handler()))
        .await
        .unwrap();

    let target: CallTarget =
        ConsumedMethodReference::new(consumer.connection_id, SERVICE, "m").into();
    let call = engine
        .open(&target, MethodType::Unary)
        .await
        .unwrap();
    assert_eq!(call.descriptor.connection_id(), provider.connection_id);
    call.requests.send(Bytes::from_static(b"ping")).await.unwrap();
    call.requests.complete();

    let response = tokio::time::timeout(TIMEOUT, call.responses.single())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"reply:ping"));
}

#[tokio::test]
async fn test_provider_disconnect_mid_stream_fails_and_releases() {
    let (lifecycle, engine) = setup();
    let provider = lifecycle
        .on_connect(PROVIDER, transport(open_stream_handler()))
        .await
        .unwrap();
    let consumer = lifecycle
        .on_connect(CONSUMER, transport(reply_handler()))
        .await
        .unwrap();

    let target: CallTarget =
        ConsumedMethodReference::new(consumer.connection_id, SERVICE, "watch").into();
    let mut stream = engine
        .call_server_streaming(&target, Bytes::from_static(b"first"))
        .await
        .unwrap();
    let first = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from_static(b"first"));

    lifecycle.on_disconnect(provider.connection_id).await.unwrap();

    let item = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(item, Err(InvocationError::CallFailed(_))));

    crate::common::eventually(|| engine.active_calls() == 0).await;
}

#[tokio::test]
async fn test_unary_shape_rejected_for_stream_method() {
    let (lifecycle, engine) = setup();
    lifecycle
        .on_connect(PROVIDER, transport(reply_handler()))
        .await
        .unwrap();
    let consumer = lifecycle
        .on_connect(CONSUMER, transport(reply_handler()))
        .await
        .unwrap();

    let target: CallTarget =
        ConsumedMethodReference::new(consumer.connection_id, SERVICE, "m").into();
    let err = engine.call_duplex(&target).await.unwrap_err();
    assert!(matches!(err, InvocationError::MethodTypeMismatch { .. }));
    assert_eq!(engine.active_calls(), 0);
}

#[tokio::test]
async fn test_reconnecting_provider_resolves_to_new_connection() {
    let (lifecycle, engine) = setup();
    let consumer = lifecycle
        .on_connect(CONSUMER, transport(reply_handler()))
        .await
        .unwrap();
    let target: CallTarget =
        ConsumedMethodReference::new(consumer.connection_id, SERVICE, "m").into();

    let err = engine
        .call_unary(&target, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::Resolve(ResolveError::NoMatch { .. })));

    let mut events = lifecycle.subscribe();
    let first = lifecycle
        .on_connect(PROVIDER, transport(reply_handler()))
        .await
        .unwrap();
    lifecycle.on_disconnect(first.connection_id).await.unwrap();
    let second = lifecycle
        .on_connect(PROVIDER, transport(reply_handler()))
        .await
        .unwrap();
    assert_ne!(first.connection_id, second.connection_id);

    let observed: Vec<_> = events.by_ref().take(3).collect().await;
    assert_eq!(
        observed,
        vec![
            LifecycleEvent::AppConnected(first.clone()),
            LifecycleEvent::AppDisconnected(first),
            LifecycleEvent::AppConnected(second),
        ]
    );

    let response = engine
        .call_unary(&target, Bytes::from_static(b"x"))
        .await
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"reply:x"));
}
