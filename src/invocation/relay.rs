//! Per-call relay between caller and transport.
//!
//! Each opened call gets one task that pumps caller requests into the
//! transport, forwards transport responses to the caller, and ends the call
//! on completion, cancellation, caller abandonment or provider disconnect.
//! Whatever ends the call, the transport stream and the active-call entry are
//! released when the task returns.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CallDescriptor, InvocationError};
use crate::lifecycle::ConnectionState;
use crate::transport::{Payload, TransportCall, TransportError};

/// Descriptors of calls whose relay is still running.
#[derive(Debug, Default)]
pub(crate) struct ActiveCalls {
    calls: Mutex<HashMap<Uuid, CallDescriptor>>,
}

impl ActiveCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CallDescriptor>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(self: &Arc<Self>, descriptor: &CallDescriptor) -> ActiveCallGuard {
        self.lock().insert(descriptor.call_id, descriptor.clone());
        ActiveCallGuard {
            calls: Arc::clone(self),
            call_id: descriptor.call_id,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<CallDescriptor> {
        self.lock().values().cloned().collect()
    }
}

/// Removes its call from `ActiveCalls` when dropped.
pub(crate) struct ActiveCallGuard {
    calls: Arc<ActiveCalls>,
    call_id: Uuid,
}

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.call_id);
    }
}

/// Caller side of the response direction.
///
/// Yields relayed items in arrival order. A call ending in failure or
/// cancellation yields one final `Err` before ending; dropping the stream
/// abandons the call.
pub struct ResponseStream {
    items: mpsc::Receiver<Payload>,
    terminal: Option<oneshot::Receiver<InvocationError>>,
    cancel: CancellationToken,
}

impl ResponseStream {
    /// Cancel the call. The stream then ends with `CallCancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await exactly one response, as unary and client-streaming calls return.
    pub async fn single(mut self) -> Result<Payload, InvocationError> {
        match self.next().await {
            Some(result) => result,
            None => Err(InvocationError::CallFailed(
                "provider completed without a response".to_string(),
            )),
        }
    }
}

impl Stream for ResponseStream {
    type Item = Result<Payload, InvocationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.items.poll_recv(cx) {
            Poll::Ready(Some(payload)) => Poll::Ready(Some(Ok(payload))),
            Poll::Ready(None) => {
                // The relay reports its terminal error before closing the item channel.
                let error = this
                    .terminal
                    .take()
                    .and_then(|mut terminal| terminal.try_recv().ok());
                Poll::Ready(error.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Caller side of the request direction. Dropping it completes the request stream.
#[derive(Debug, Clone)]
pub struct RequestSender {
    requests: mpsc::Sender<Payload>,
    cancel: CancellationToken,
}

impl RequestSender {
    pub async fn send(&self, payload: Payload) -> Result<(), InvocationError> {
        self.requests.send(payload).await.map_err(|_| {
            if self.cancel.is_cancelled() {
                InvocationError::CallCancelled
            } else {
                InvocationError::CallFailed("call no longer accepts requests".to_string())
            }
        })
    }

    /// Signal that no more requests follow.
    pub fn complete(self) {}

    /// Resolves once the call no longer accepts requests.
    pub async fn closed(&self) {
        self.requests.closed().await
    }
}

/// A call opened in any shape: descriptor plus both caller-side directions.
#[derive(Debug)]
pub struct OpenCall {
    pub descriptor: CallDescriptor,
    pub requests: RequestSender,
    pub responses: ResponseStream,
}

impl OpenCall {
    pub fn cancel(&self) {
        self.responses.cancel();
    }
}

/// An open client-streaming call.
#[derive(Debug)]
pub struct ClientStreamingCall {
    pub descriptor: CallDescriptor,
    requests: RequestSender,
    responses: ResponseStream,
}

impl ClientStreamingCall {
    pub async fn send(&self, payload: Payload) -> Result<(), InvocationError> {
        self.requests.send(payload).await
    }

    /// Finish sending and await the provider's single response.
    pub async fn complete(self) -> Result<Payload, InvocationError> {
        let Self {
            requests,
            responses,
            ..
        } = self;
        requests.complete();
        responses.single().await
    }

    pub fn cancel(self) {
        self.responses.cancel();
    }
}

impl From<OpenCall> for ClientStreamingCall {
    fn from(call: OpenCall) -> Self {
        Self {
            descriptor: call.descriptor,
            requests: call.requests,
            responses: call.responses,
        }
    }
}

/// An open duplex call. The two directions are independent.
#[derive(Debug)]
pub struct DuplexCall {
    pub descriptor: CallDescriptor,
    pub requests: RequestSender,
    pub responses: ResponseStream,
}

impl DuplexCall {
    pub fn cancel(&self) {
        self.responses.cancel();
    }
}

impl From<OpenCall> for DuplexCall {
    fn from(call: OpenCall) -> Self {
        Self {
            descriptor: call.descriptor,
            requests: call.requests,
            responses: call.responses,
        }
    }
}

enum Outcome {
    Completed,
    Abandoned,
    Ended(InvocationError),
}

/// The relay task for one call.
pub(crate) struct Relay {
    descriptor: CallDescriptor,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    caller_requests: mpsc::Receiver<Payload>,
    caller_items: mpsc::Sender<Payload>,
    terminal: oneshot::Sender<InvocationError>,
    transport: TransportCall,
    guard: ActiveCallGuard,
}

impl Relay {
    /// Wire a relay for `transport` and return it with the caller's handle.
    pub(crate) fn new(
        descriptor: CallDescriptor,
        state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
        transport: TransportCall,
        guard: ActiveCallGuard,
        capacity: usize,
    ) -> (Self, OpenCall) {
        let capacity = capacity.max(1);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (item_tx, item_rx) = mpsc::channel(capacity);
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let call = OpenCall {
            descriptor: descriptor.clone(),
            requests: RequestSender {
                requests: request_tx,
                cancel: cancel.clone(),
            },
            responses: ResponseStream {
                items: item_rx,
                terminal: Some(terminal_rx),
                cancel: cancel.clone(),
            },
        };
        let relay = Self {
            descriptor,
            state,
            cancel,
            caller_requests: request_rx,
            caller_items: item_tx,
            terminal: terminal_tx,
            transport,
            guard,
        };
        (relay, call)
    }

    pub(crate) async fn run(self) {
        let Relay {
            descriptor,
            mut state,
            cancel,
            caller_requests,
            caller_items,
            terminal,
            transport,
            guard,
        } = self;
        let TransportCall {
            requests: transport_requests,
            responses: mut inbound,
        } = transport;

        let mut pump = Box::pin(pump_requests(caller_requests, transport_requests));
        let mut pump_done = false;
        // Response item waiting for caller capacity. Requests keep flowing meanwhile.
        let mut pending: Option<Payload> = None;
        let mut relayed: u64 = 0;
        let connection_id = descriptor.connection_id();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Ended(InvocationError::CallCancelled),
                _ = disconnected(&mut state) => {
                    break Outcome::Ended(InvocationError::CallFailed(format!(
                        "connection {connection_id} disconnected"
                    )));
                }
                permit = caller_items.reserve(), if pending.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(payload) = pending.take() {
                            permit.send(payload);
                            relayed += 1;
                        }
                    }
                    Err(_) => break Outcome::Abandoned,
                },
                item = inbound.next(), if pending.is_none() => match item {
                    Some(Ok(payload)) => pending = Some(payload),
                    Some(Err(TransportError::Cancelled)) => {
                        break Outcome::Ended(InvocationError::CallCancelled);
                    }
                    Some(Err(e)) => break Outcome::Ended(InvocationError::CallFailed(e.to_string())),
                    None => break Outcome::Completed,
                },
                _ = &mut pump, if !pump_done => {
                    pump_done = true;
                }
                _ = caller_items.closed() => break Outcome::Abandoned,
            }
        };

        // Release the transport stream before reporting.
        drop(inbound);

        match outcome {
            Outcome::Completed => {
                debug!(call = %descriptor, call_id = %descriptor.call_id, relayed, "Call completed");
            }
            Outcome::Abandoned => {
                debug!(call = %descriptor, call_id = %descriptor.call_id, relayed, "Call abandoned by caller");
            }
            Outcome::Ended(error) => {
                info!(
                    call = %descriptor,
                    call_id = %descriptor.call_id,
                    relayed,
                    error = %error,
                    "Call ended"
                );
                let _ = terminal.send(error);
            }
        }

        // Closing the request receiver lets producers feeding this call stop.
        drop(pump);
        drop(caller_items);
        drop(guard);
    }
}

/// Forward caller requests until the caller completes or the peer stops reading.
/// Returning drops the transport sender, which signals completion to the peer.
async fn pump_requests(mut from: mpsc::Receiver<Payload>, to: mpsc::Sender<Payload>) {
    loop {
        tokio::select! {
            biased;
            _ = to.closed() => break,
            next = from.recv() => match next {
                Some(payload) => {
                    if to.send(payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Resolves once the watched connection is disconnected or released.
async fn disconnected(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() == ConnectionState::Disconnected {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
