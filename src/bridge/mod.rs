//! Remote event stream bridges.
//!
//! A `RemoteEventBridge` relays a provider's server-streaming method into a
//! local broadcast point. Relays are keyed by provider connection and each
//! owns a cancellation token, so stopping one never touches another call on
//! the same connection. Subscribers only see items sent after they subscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EventSourceConfig, RetryConfig};
use crate::invocation::{CallTarget, InvocationEngine, ProvidedMethodReference};
use crate::lifecycle::{AppConnectionDescriptor, ConnectionId};
use crate::transport::Payload;
use crate::utils::retry::retry_delays;

mod event_source;

pub use event_source::EventSourceWatcher;

/// One item relayed from a remote stream.
#[derive(Debug, Clone)]
pub struct BridgedEvent {
    pub source: AppConnectionDescriptor,
    pub payload: Payload,
}

struct RelayEntry {
    id: Uuid,
    cancel: CancellationToken,
}

/// Local broadcast point fed by relays of one server-streaming method.
pub struct RemoteEventBridge {
    engine: Arc<InvocationEngine>,
    source: EventSourceConfig,
    events: broadcast::Sender<BridgedEvent>,
    relays: Arc<Mutex<HashMap<ConnectionId, RelayEntry>>>,
    retry: RetryConfig,
    root: CancellationToken,
}

impl RemoteEventBridge {
    pub fn new(
        engine: Arc<InvocationEngine>,
        source: EventSourceConfig,
        capacity: usize,
        retry: RetryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            engine,
            source,
            events,
            relays: Arc::new(Mutex::new(HashMap::new())),
            retry,
            root: CancellationToken::new(),
        }
    }

    pub fn source(&self) -> &EventSourceConfig {
        &self.source
    }

    /// Start relaying from `target`. Returns `false` if a relay for that
    /// connection is already running or the bridge has shut down.
    pub fn bridge(&self, target: &AppConnectionDescriptor) -> bool {
        if self.root.is_cancelled() {
            return false;
        }

        let id = Uuid::new_v4();
        let cancel = self.root.child_token();
        {
            let mut relays = lock(&self.relays);
            if relays.contains_key(&target.connection_id) {
                return false;
            }
            relays.insert(
                target.connection_id,
                RelayEntry {
                    id,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            service = %self.source.service,
            method = %self.source.method,
            application_id = %target.application_id,
            connection_id = %target.connection_id,
            "Starting event bridge"
        );

        let relay = BridgeRelay {
            engine: Arc::clone(&self.engine),
            target: target.clone(),
            call: CallTarget::Provided(ProvidedMethodReference::new(
                self.source.service.clone(),
                self.source.method.clone(),
                target,
            )),
            events: self.events.clone(),
            retry: self.retry.clone(),
            cancel,
        };
        let relays = Arc::clone(&self.relays);
        let connection_id = target.connection_id;
        tokio::spawn(async move {
            relay.run().await;
            let mut relays = lock(&relays);
            if relays.get(&connection_id).is_some_and(|entry| entry.id == id) {
                relays.remove(&connection_id);
            }
        });
        true
    }

    /// Stop the relay for `connection_id`. Returns whether one was running.
    pub fn stop(&self, connection_id: ConnectionId) -> bool {
        match lock(&self.relays).remove(&connection_id) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(connection_id = %connection_id, service = %self.source.service, "Stopped event bridge");
                true
            }
            None => false,
        }
    }

    /// Stop every relay; later `bridge` calls are refused.
    pub fn shutdown(&self) {
        self.root.cancel();
        lock(&self.relays).clear();
    }

    pub fn is_bridging(&self, connection_id: ConnectionId) -> bool {
        lock(&self.relays).contains_key(&connection_id)
    }

    pub fn relay_count(&self) -> usize {
        lock(&self.relays).len()
    }

    /// Items relayed after this call.
    pub fn subscribe(&self) -> BoxStream<'static, BridgedEvent> {
        let service = self.source.service.clone();
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |item| {
                let service = service.clone();
                async move {
                    match item {
                        Ok(event) => Some(event),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(service = %service, skipped, "Bridge subscriber lagged, skipped events");
                            None
                        }
                    }
                }
            })
            .boxed()
    }

    /// Broadcast an item to current subscribers. Returns how many received it.
    pub fn publish(&self, event: BridgedEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

impl std::fmt::Debug for RemoteEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEventBridge")
            .field("source", &self.source)
            .field("relays", &self.relay_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum StreamEnd {
    Completed,
    Cancelled,
    Failed,
}

/// Background relay for one provider connection.
struct BridgeRelay {
    engine: Arc<InvocationEngine>,
    target: AppConnectionDescriptor,
    call: CallTarget,
    events: broadcast::Sender<BridgedEvent>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl BridgeRelay {
    async fn run(self) {
        let mut delays = retry_delays(&self.retry);
        loop {
            match self.relay_once().await {
                StreamEnd::Completed => {
                    info!(connection_id = %self.target.connection_id, "Event stream completed");
                    return;
                }
                StreamEnd::Cancelled => return,
                StreamEnd::Failed => {}
            }

            // Only retry while the provider is still there.
            if !self
                .engine
                .lifecycle()
                .is_connected(self.target.connection_id)
                .await
            {
                return;
            }
            let Some(delay) = delays.next() else {
                debug!(connection_id = %self.target.connection_id, "Event bridge not retrying");
                return;
            };
            if !self.sleep(delay).await {
                return;
            }
        }
    }

    /// Open the stream once and relay until it ends.
    async fn relay_once(&self) -> StreamEnd {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
            opened = self.engine.call_server_streaming(&self.call, Bytes::new()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    application_id = %self.target.application_id,
                    connection_id = %self.target.connection_id,
                    error = %e,
                    "Failed to open event stream"
                );
                return StreamEnd::Failed;
            }
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    stream.cancel();
                    return StreamEnd::Cancelled;
                }
                item = stream.next() => match item {
                    Some(Ok(payload)) => {
                        let receivers = self
                            .events
                            .send(BridgedEvent {
                                source: self.target.clone(),
                                payload,
                            })
                            .unwrap_or(0);
                        debug!(receivers, connection_id = %self.target.connection_id, "Bridged event");
                    }
                    Some(Err(e)) => {
                        if self.cancel.is_cancelled() {
                            return StreamEnd::Cancelled;
                        }
                        warn!(
                            application_id = %self.target.application_id,
                            connection_id = %self.target.connection_id,
                            error = %e,
                            "Event stream failed"
                        );
                        return StreamEnd::Failed;
                    }
                    None => return StreamEnd::Completed,
                }
            }
        }
    }

    /// Returns `false` if cancelled while waiting.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
