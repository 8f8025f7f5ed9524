//! Shared utilities for integration tests.
//!
//! Registry documents, in-process providers and polling helpers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use interop_broker::transport::memory::{handler_fn, CallHandler, IncomingCall, MemoryTransport};
use interop_broker::transport::ConnectionTransport;

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub const SERVICE: &str = "S";
pub const CONSUMER: &str = "A";
pub const PROVIDER: &str = "B";
pub const LAUNCHER: &str = "launcher";

/// `A` consumes `S` from anyone; `B` provides `S` to `A` only; `launcher`
/// provides the application launcher event stream.
pub const REGISTRY: &str = r#"{
  "services": [
    { "id": "S", "methods": [
      { "name": "m", "input": "Req", "output": "Resp", "type": "Unary" },
      { "name": "watch", "input": "Req", "output": "Resp", "type": "ServerStreaming" }
    ] },
    { "id": "interop.AppLauncherService", "methods": [
      { "name": "AppLaunchedEventStream", "input": "Empty", "output": "AppLaunchedEvent", "type": "ServerStreaming" }
    ] }
  ],
  "applications": [
    { "id": "A", "consumes": [ { "service": "S", "from": "*", "methods": ["m", "watch"] } ] },
    { "id": "B", "provides": [ { "service": "S", "to": "A", "methods": [ { "name": "m" }, { "name": "watch" } ] } ] },
    { "id": "launcher", "provides": [ { "service": "interop.AppLauncherService", "methods": [ { "name": "AppLaunchedEventStream" } ] } ] }
  ]
}"#;

/// Answers every request with `reply:<request>`.
pub fn reply_handler() -> Arc<dyn CallHandler> {
    handler_fn(|mut call: IncomingCall| async move {
        while let Some(request) = call.next_request().await {
            let mut reply = b"reply:".to_vec();
            reply.extend_from_slice(&request);
            if !call.respond(Bytes::from(reply)).await {
                break;
            }
        }
    })
}

/// Emits one item per request, then holds the call open until abandoned.
pub fn open_stream_handler() -> Arc<dyn CallHandler> {
    handler_fn(|mut call: IncomingCall| async move {
        if let Some(request) = call.next_request().await {
            call.respond(request).await;
        }
        call.abandoned().await;
    })
}

pub fn transport(handler: Arc<dyn CallHandler>) -> Arc<dyn ConnectionTransport> {
    Arc::new(MemoryTransport::new(handler))
}

pub fn write_registry(dir: &Path, document: &str) {
    std::fs::write(dir.join("interop.json"), document).expect("write registry document");
}

/// Poll `condition` until it holds or `TIMEOUT` elapses.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
