//! Broker runner: metadata loading, reload, event bridging and shutdown.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;

use interop_broker::broker::{BrokerError, BrokerRunner};
use interop_broker::config::{Config, APP_LAUNCHED_EVENT_STREAM, APP_LAUNCHER_SERVICE};
use interop_broker::invocation::{CallTarget, ConsumedMethodReference, InvocationError};
use interop_broker::lifecycle::LifecycleError;
use interop_broker::transport::memory::{handler_fn, IncomingCall};

use crate::common::{
    eventually, open_stream_handler, reply_handler, transport, write_registry, CONSUMER, LAUNCHER,
    PROVIDER, REGISTRY, SERVICE, TIMEOUT,
};

fn config_for(dir: &std::path::Path, reload_interval_ms: u64) -> Config {
    let mut config = Config::for_test();
    config.metadata.dir = dir.to_path_buf();
    config.metadata.reload_interval_ms = reload_interval_ms;
    config
}

#[tokio::test]
async fn test_load_fails_without_document() {
    let dir = tempfile::tempdir().unwrap();

    let result = BrokerRunner::load(config_for(dir.path(), 0)).await;
    assert!(matches!(result, Err(BrokerError::Metadata(_))));
}

#[tokio::test]
async fn test_load_rejects_invalid_document() {
    let dir = tempfile::tempdir().unwrap();
    write_registry(dir.path(), r#"{ "applications": [ { "id": "A", "consumes": [ { "service": "missing" } ] } ] }"#);

    let result = BrokerRunner::load(config_for(dir.path(), 0)).await;
    assert!(matches!(result, Err(BrokerError::Registry(_))));
}

#[tokio::test]
async fn test_launcher_events_bridged_on_connect() {
    let dir = tempfile::tempdir().unwrap();
    write_registry(dir.path(), REGISTRY);
    let runner = BrokerRunner::load(config_for(dir.path(), 0)).await.unwrap();
    runner.start();

    let broker = Arc::clone(runner.broker());
    let bridge = Arc::clone(
        broker
            .bridge(APP_LAUNCHER_SERVICE, APP_LAUNCHED_EVENT_STREAM)
            .unwrap(),
    );
    let mut events = bridge.subscribe();

    let launched = handler_fn(|call: IncomingCall| async move {
        call.respond(Bytes::from_static(b"app.notes launched")).await;
        call.abandoned().await;
    });
    let launcher = broker
        .lifecycle()
        .on_connect(LAUNCHER, transport(launched))
        .await
        .unwrap();

    let event = tokio::time::timeout(TIMEOUT, events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload, Bytes::from_static(b"app.notes launched"));
    assert_eq!(event.source, launcher);

    broker
        .lifecycle()
        .on_disconnect(launcher.connection_id)
        .await
        .unwrap();
    eventually(|| !bridge.is_bridging(launcher.connection_id)).await;

    assert!(runner.stop().await);
}

#[tokio::test]
async fn test_metadata_reload_applies_new_registry() {
    let dir = tempfile::tempdir().unwrap();
    write_registry(dir.path(), REGISTRY);
    let runner = BrokerRunner::load(config_for(dir.path(), 20)).await.unwrap();
    runner.start();
    let registry = Arc::clone(runner.broker().registry());
    let mut snapshots = registry.subscribe();
    let initial = snapshots.next().await.unwrap();
    assert!(initial.service("T").is_none());

    // A broken document is ignored; the current snapshot keeps serving.
    write_registry(dir.path(), "{ not json");
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert!(Arc::ptr_eq(&registry.current(), &initial));

    let updated = REGISTRY.replace(r#"{ "id": "S", "methods""#, r#"{ "id": "T", "methods": [] }, { "id": "S", "methods""#);
    write_registry(dir.path(), &updated);

    let next = tokio::time::timeout(TIMEOUT, snapshots.next())
        .await
        .unwrap()
        .unwrap();
    assert!(next.service("T").is_some());
    assert!(next.service(SERVICE).is_some());

    runner.stop().await;
}

#[tokio::test]
async fn test_stop_releases_open_calls_once() {
    let dir = tempfile::tempdir().unwrap();
    write_registry(dir.path(), REGISTRY);
    let runner = Arc::new(BrokerRunner::load(config_for(dir.path(), 0)).await.unwrap());
    runner.start();

    let broker = Arc::clone(runner.broker());
    broker
        .lifecycle()
        .on_connect(PROVIDER, transport(open_stream_handler()))
        .await
        .unwrap();
    let consumer = broker
        .lifecycle()
        .on_connect(CONSUMER, transport(reply_handler()))
        .await
        .unwrap();
    let target: CallTarget =
        ConsumedMethodReference::new(consumer.connection_id, SERVICE, "watch").into();
    let mut stream = broker
        .engine()
        .call_server_streaming(&target, Bytes::from_static(b"open"))
        .await
        .unwrap();
    let _ = tokio::time::timeout(TIMEOUT, stream.next()).await.unwrap();
    assert_eq!(broker.engine().active_calls(), 1);

    let (first, second) = tokio::join!(runner.stop(), runner.stop());
    assert!(first ^ second);

    let terminal = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(terminal.is_err());
    eventually(|| broker.engine().active_calls() == 0).await;
    assert!(broker.lifecycle().is_empty().await);

    let err = broker
        .lifecycle()
        .on_connect(CONSUMER, transport(reply_handler()))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ShutDown));

    let err = broker
        .engine()
        .call_unary(&target, Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::ShuttingDown));
}
