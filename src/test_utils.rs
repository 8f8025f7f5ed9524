//! Test fixtures shared by unit tests.

use std::sync::Arc;

use bytes::Bytes;

use crate::registry::{MethodType, Registry, RegistryProvider};
use crate::transport::memory::{handler_fn, CallHandler, IncomingCall, MemoryTransport};
use crate::transport::{ConnectionTransport, Payload};

pub const ECHO_SERVICE: &str = "interop.EchoService";
pub const LAUNCHER_SERVICE: &str = "interop.AppLauncherService";
pub const LAUNCHED_METHOD: &str = "AppLaunchedEventStream";

pub const CONSUMER_APP: &str = "app.consumer";
pub const ECHO_APP: &str = "app.echo";
pub const LAUNCHER_APP: &str = "app.launcher";

/// Consumer accepts any provider; the echo provider only serves `app.consumer`.
pub const SAMPLE_REGISTRY: &str = r#"{
  "messages": [
    { "id": "interop.EchoRequest" },
    { "id": "interop.Empty" },
    { "id": "interop.AppLaunchedEvent" }
  ],
  "services": [
    {
      "id": "interop.EchoService",
      "methods": [
        { "name": "Unary", "input": "interop.EchoRequest", "output": "interop.EchoRequest", "type": "Unary" },
        { "name": "ClientStreaming", "input": "interop.EchoRequest", "output": "interop.EchoRequest", "type": "ClientStreaming" },
        { "name": "ServerStreaming", "input": "interop.EchoRequest", "output": "interop.EchoRequest", "type": "ServerStreaming" },
        { "name": "DuplexStreaming", "input": "interop.EchoRequest", "output": "interop.EchoRequest", "type": "DuplexStreaming" }
      ]
    },
    {
      "id": "interop.AppLauncherService",
      "methods": [
        { "name": "AppLaunchedEventStream", "input": "interop.Empty", "output": "interop.AppLaunchedEvent", "type": "ServerStreaming" }
      ]
    }
  ],
  "applications": [
    {
      "id": "app.consumer",
      "consumes": [
        { "service": "interop.EchoService", "from": "*", "methods": ["Unary", "ClientStreaming", "ServerStreaming", "DuplexStreaming"] }
      ]
    },
    {
      "id": "app.echo",
      "provides": [
        { "service": "interop.EchoService", "to": "app.consumer", "methods": [
          { "name": "Unary", "title": "Echo" },
          { "name": "ClientStreaming" },
          { "name": "ServerStreaming" },
          { "name": "DuplexStreaming" }
        ] }
      ]
    },
    {
      "id": "app.launcher",
      "provides": [
        { "service": "interop.AppLauncherService", "to": "*", "methods": [ { "name": "AppLaunchedEventStream" } ] }
      ]
    }
  ]
}"#;

pub fn sample_registry() -> Registry {
    crate::registry::parse(SAMPLE_REGISTRY.as_bytes()).unwrap()
}

pub fn sample_provider() -> Arc<RegistryProvider> {
    Arc::new(RegistryProvider::new(sample_registry()))
}

/// Echo provider: unary and server-streaming calls echo the request,
/// client-streaming calls answer with the concatenated requests, duplex
/// calls echo each request as it arrives.
pub fn echo_handler() -> Arc<dyn CallHandler> {
    handler_fn(|mut call: IncomingCall| async move {
        match call.descriptor.method_type() {
            MethodType::ClientStreaming => {
                let mut joined = Vec::new();
                while let Some(request) = call.next_request().await {
                    joined.extend_from_slice(&request);
                }
                call.respond(Bytes::from(joined)).await;
            }
            _ => {
                while let Some(request) = call.next_request().await {
                    if !call.respond(request).await {
                        break;
                    }
                }
            }
        }
    })
}

pub fn echo_transport() -> Arc<dyn ConnectionTransport> {
    Arc::new(MemoryTransport::new(echo_handler()))
}

/// Provider that never answers and holds the call open until abandoned.
pub fn silent_handler() -> Arc<dyn CallHandler> {
    handler_fn(|call: IncomingCall| async move {
        call.abandoned().await;
    })
}

/// Payload for a test string.
pub fn payload(text: &str) -> Payload {
    Bytes::copy_from_slice(text.as_bytes())
}
