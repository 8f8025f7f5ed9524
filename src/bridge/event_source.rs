//! Starts and stops bridges as event-source providers come and go.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RemoteEventBridge;
use crate::lifecycle::{AppConnectionDescriptor, AppLifecycleManager, LifecycleEvent};

/// Reacts to lifecycle events for a set of bridges.
pub struct EventSourceWatcher {
    lifecycle: Arc<AppLifecycleManager>,
    bridges: Vec<Arc<RemoteEventBridge>>,
}

impl EventSourceWatcher {
    pub fn new(lifecycle: Arc<AppLifecycleManager>, bridges: Vec<Arc<RemoteEventBridge>>) -> Self {
        Self { lifecycle, bridges }
    }

    pub fn bridges(&self) -> &[Arc<RemoteEventBridge>] {
        &self.bridges
    }

    /// Watch lifecycle events until `cancel` fires.
    ///
    /// Subscribes before returning, then bridges providers that were
    /// already connected.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.lifecycle.subscribe();
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            for descriptor in watcher.lifecycle.list_connected().await {
                watcher.on_connected(&descriptor);
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => watcher.on_event(&event),
                        None => break,
                    }
                }
            }
            debug!("Event source watcher stopped");
        })
    }

    pub fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::AppConnected(descriptor) => self.on_connected(descriptor),
            LifecycleEvent::AppDisconnected(descriptor) => {
                for bridge in &self.bridges {
                    bridge.stop(descriptor.connection_id);
                }
            }
        }
    }

    fn on_connected(&self, descriptor: &AppConnectionDescriptor) {
        let registry = self.lifecycle.registry().current();
        for bridge in &self.bridges {
            let source = bridge.source();
            if registry.is_provider(&descriptor.application_id, &source.service) {
                bridge.bridge(descriptor);
            }
        }
    }
}
