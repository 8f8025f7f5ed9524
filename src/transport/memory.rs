//! In-process loopback transport.
//!
//! Each opened call is served by a `CallHandler` running on its own task.
//! Useful for embedding providers in the broker process and for tests.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConnectionTransport, Payload, TransportCall, TransportError};
use crate::invocation::CallDescriptor;

/// Buffered items per call direction.
const DEFAULT_CAPACITY: usize = 32;

/// Provider side of a single call.
pub struct IncomingCall {
    pub descriptor: CallDescriptor,
    /// Requests from the caller; ends when the caller completes.
    pub requests: ReceiverStream<Payload>,
    responder: Responder,
}

impl IncomingCall {
    /// Send a response item. Returns `false` once the caller is gone.
    pub async fn respond(&self, payload: Payload) -> bool {
        self.responder.respond(payload).await
    }

    /// Terminate the call with an error.
    pub async fn fail(self, error: TransportError) {
        self.responder.fail(error).await
    }

    /// Terminate the call as cancelled by the provider.
    pub async fn cancel(self) {
        self.fail(TransportError::Cancelled).await;
    }

    /// Resolves when the caller abandons the call.
    pub async fn abandoned(&self) {
        self.responder.abandoned().await
    }

    /// Next request, or `None` once the caller has completed.
    pub async fn next_request(&mut self) -> Option<Payload> {
        self.requests.next().await
    }

    /// Separate the two directions so they can be driven concurrently.
    pub fn split(self) -> (ReceiverStream<Payload>, Responder) {
        (self.requests, self.responder)
    }
}

/// Response direction of an `IncomingCall`.
#[derive(Debug, Clone)]
pub struct Responder {
    responses: mpsc::Sender<Result<Payload, TransportError>>,
}

impl Responder {
    /// Send a response item. Returns `false` once the caller is gone.
    pub async fn respond(&self, payload: Payload) -> bool {
        self.responses.send(Ok(payload)).await.is_ok()
    }

    /// Terminate the call with an error.
    pub async fn fail(self, error: TransportError) {
        let _ = self.responses.send(Err(error)).await;
    }

    /// Resolves when the caller abandons the call.
    pub async fn abandoned(&self) {
        self.responses.closed().await
    }
}

/// Serves calls opened on a `MemoryTransport`.
///
/// Returning completes the response stream.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, call: IncomingCall);
}

/// `CallHandler` backed by an async closure.
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a call handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CallHandler>
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<F, Fut> CallHandler for HandlerFn<F>
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, call: IncomingCall) {
        (self.0)(call).await
    }
}

/// Loopback transport dispatching every call to one handler.
pub struct MemoryTransport {
    handler: Arc<dyn CallHandler>,
    capacity: usize,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn new(handler: Arc<dyn CallHandler>) -> Self {
        Self::with_capacity(handler, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(handler: Arc<dyn CallHandler>, capacity: usize) -> Self {
        Self {
            handler,
            capacity: capacity.max(1),
            closed: CancellationToken::new(),
        }
    }

    /// Tear down the transport: new calls fail and in-flight calls end with `Closed`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl ConnectionTransport for MemoryTransport {
    async fn open_call(&self, descriptor: &CallDescriptor) -> Result<TransportCall, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (request_tx, request_rx) = mpsc::channel(self.capacity);
        let (response_tx, response_rx) = mpsc::channel(self.capacity);

        let call = IncomingCall {
            descriptor: descriptor.clone(),
            requests: ReceiverStream::new(request_rx),
            responder: Responder {
                responses: response_tx.clone(),
            },
        };
        let handler = Arc::clone(&self.handler);
        let closed = self.closed.clone();
        let call_id = descriptor.call_id;

        tokio::spawn(async move {
            tokio::select! {
                _ = handler.handle(call) => {
                    debug!(call_id = %call_id, "Memory call handler finished");
                }
                _ = closed.cancelled() => {
                    let _ = response_tx.send(Err(TransportError::Closed)).await;
                    debug!(call_id = %call_id, "Memory transport closed during call");
                }
            }
        });

        Ok(TransportCall {
            requests: request_tx,
            responses: ReceiverStream::new(response_rx).boxed(),
        })
    }
}
