//! Application connection lifecycle.
//!
//! Tracks which applications are connected, hands out fresh connection ids,
//! and broadcasts connect/disconnect events. Each connection moves through
//! `Connecting -> Connected -> Disconnected`; the terminal state is published
//! on a per-connection watch channel so in-flight calls can fail promptly.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::RegistryProvider;
use crate::transport::ConnectionTransport;

/// Lifecycle events buffered per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Process-unique connection identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live application connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppConnectionDescriptor {
    pub application_id: String,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    AppConnected(AppConnectionDescriptor),
    AppDisconnected(AppConnectionDescriptor),
}

impl LifecycleEvent {
    pub fn descriptor(&self) -> &AppConnectionDescriptor {
        match self {
            Self::AppConnected(descriptor) | Self::AppDisconnected(descriptor) => descriptor,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Application '{0}' is not declared in the registry")]
    UnknownApplication(String),

    #[error("Lifecycle manager is shut down")]
    ShutDown,
}

/// Routing view of a connection: who it is, how to reach it, whether it is alive.
#[derive(Clone)]
pub struct AppConnection {
    pub descriptor: AppConnectionDescriptor,
    pub transport: Arc<dyn ConnectionTransport>,
    state: watch::Receiver<ConnectionState>,
}

impl AppConnection {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing this connection's state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl fmt::Debug for AppConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConnection")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .finish()
    }
}

struct ConnectionEntry {
    descriptor: AppConnectionDescriptor,
    transport: Arc<dyn ConnectionTransport>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionEntry {
    fn handle(&self) -> AppConnection {
        AppConnection {
            descriptor: self.descriptor.clone(),
            transport: Arc::clone(&self.transport),
            state: self.state.subscribe(),
        }
    }
}

/// Sole owner and mutator of the connected-applications set.
pub struct AppLifecycleManager {
    registry: Arc<RegistryProvider>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    events: broadcast::Sender<LifecycleEvent>,
    /// Set under the write lock; checked under it by `on_connect`.
    closed: AtomicBool,
}

impl AppLifecycleManager {
    pub fn new(registry: Arc<RegistryProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            connections: RwLock::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Register a new connection for `application_id`.
    ///
    /// The connection is visible as `Connected` before `AppConnected` is
    /// published, so subscribers reacting to the event can route to it.
    #[tracing::instrument(name = "lifecycle.connect", skip(self, transport))]
    pub async fn on_connect(
        &self,
        application_id: &str,
        transport: Arc<dyn ConnectionTransport>,
    ) -> Result<AppConnectionDescriptor, LifecycleError> {
        if self.registry.current().application(application_id).is_none() {
            warn!(application_id = %application_id, "Rejected connection from undeclared application");
            return Err(LifecycleError::UnknownApplication(
                application_id.to_string(),
            ));
        }

        let descriptor = AppConnectionDescriptor {
            application_id: application_id.to_string(),
            connection_id: ConnectionId::new(),
        };
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let mut connections = self.connections.write().await;
        if self.closed.load(Ordering::SeqCst) {
            warn!(application_id = %application_id, "Rejected connection after shutdown");
            return Err(LifecycleError::ShutDown);
        }
        state.send_replace(ConnectionState::Connected);
        connections.insert(
            descriptor.connection_id,
            ConnectionEntry {
                descriptor: descriptor.clone(),
                transport,
                state,
            },
        );
        // Publish under the lock so a racing disconnect cannot overtake this event.
        let receivers = self
            .events
            .send(LifecycleEvent::AppConnected(descriptor.clone()))
            .unwrap_or(0);
        drop(connections);

        info!(
            application_id = %descriptor.application_id,
            connection_id = %descriptor.connection_id,
            receivers,
            "Application connected"
        );
        Ok(descriptor)
    }

    /// Mark `connection_id` as disconnected and release it.
    #[tracing::instrument(name = "lifecycle.disconnect", skip(self))]
    pub async fn on_disconnect(
        &self,
        connection_id: ConnectionId,
    ) -> Result<AppConnectionDescriptor, LifecycleError> {
        let mut connections = self.connections.write().await;
        let entry = connections
            .remove(&connection_id)
            .ok_or(LifecycleError::UnknownConnection(connection_id))?;
        entry.state.send_replace(ConnectionState::Disconnected);
        let receivers = self
            .events
            .send(LifecycleEvent::AppDisconnected(entry.descriptor.clone()))
            .unwrap_or(0);
        drop(connections);

        info!(
            application_id = %entry.descriptor.application_id,
            connection_id = %connection_id,
            receivers,
            "Application disconnected"
        );
        Ok(entry.descriptor)
    }

    /// Release every connection and refuse new ones. Returns how many were released.
    pub async fn shutdown(&self) -> usize {
        let mut connections = self.connections.write().await;
        self.closed.store(true, Ordering::SeqCst);
        let released: Vec<_> = connections.drain().map(|(_, entry)| entry).collect();
        for entry in &released {
            entry.state.send_replace(ConnectionState::Disconnected);
            let _ = self
                .events
                .send(LifecycleEvent::AppDisconnected(entry.descriptor.clone()));
        }
        drop(connections);

        for entry in &released {
            info!(
                application_id = %entry.descriptor.application_id,
                connection_id = %entry.descriptor.connection_id,
                "Application disconnected on shutdown"
            );
        }
        released.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Point-in-time snapshot of live connections. May be stale by the time it is used.
    pub async fn list_connected(&self) -> Vec<AppConnectionDescriptor> {
        self.connections
            .read()
            .await
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Routing handle for a live connection.
    pub async fn connection(&self, connection_id: ConnectionId) -> Option<AppConnection> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(ConnectionEntry::handle)
    }

    /// State of `connection_id`; `None` once it has been released.
    pub async fn state(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|entry| *entry.state.borrow())
    }

    pub async fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.state(connection_id).await == Some(ConnectionState::Connected)
    }

    /// Events published after this call; no replay.
    pub fn subscribe(&self) -> BoxStream<'static, LifecycleEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle subscriber lagged, skipped events");
                        None
                    }
                }
            })
            .boxed()
    }

    pub fn registry(&self) -> &Arc<RegistryProvider> {
        &self.registry
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl fmt::Debug for AppLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppLifecycleManager").finish_non_exhaustive()
    }
}
