//! Broker assembly and process lifecycle.
//!
//! `Broker` wires the registry provider, lifecycle manager, invocation
//! engine and event bridges together. `BrokerRunner` owns the background
//! tasks and the root cancellation token; start and stop are idempotent and
//! a stop racing a start still releases everything exactly once.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{EventSourceWatcher, RemoteEventBridge};
use crate::config::Config;
use crate::invocation::InvocationEngine;
use crate::lifecycle::AppLifecycleManager;
use crate::metadata::{digest, MetadataError, MetadataSource};
use crate::registry::{RegistryFormatError, RegistryProvider};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Invalid metadata document: {0}")]
    Registry(#[from] RegistryFormatError),
}

/// The broker's components, sharing one registry provider.
pub struct Broker {
    registry: Arc<RegistryProvider>,
    lifecycle: Arc<AppLifecycleManager>,
    engine: Arc<InvocationEngine>,
    watcher: Arc<EventSourceWatcher>,
}

impl Broker {
    pub fn new(config: &Config, registry: Arc<RegistryProvider>) -> Self {
        let lifecycle = Arc::new(AppLifecycleManager::new(Arc::clone(&registry)));
        let engine = Arc::new(InvocationEngine::new(
            Arc::clone(&lifecycle),
            &config.invocation,
        ));
        let bridges = config
            .bridge
            .event_sources
            .iter()
            .map(|source| {
                Arc::new(RemoteEventBridge::new(
                    Arc::clone(&engine),
                    source.clone(),
                    config.bridge.capacity,
                    config.bridge.retry.clone(),
                ))
            })
            .collect();
        let watcher = Arc::new(EventSourceWatcher::new(Arc::clone(&lifecycle), bridges));

        Self {
            registry,
            lifecycle,
            engine,
            watcher,
        }
    }

    pub fn registry(&self) -> &Arc<RegistryProvider> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<AppLifecycleManager> {
        &self.lifecycle
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    /// Bridge for a configured event source.
    pub fn bridge(&self, service: &str, method: &str) -> Option<&Arc<RemoteEventBridge>> {
        self.watcher
            .bridges()
            .iter()
            .find(|bridge| bridge.source().service == service && bridge.source().method == method)
    }

    pub fn bridges(&self) -> &[Arc<RemoteEventBridge>] {
        self.watcher.bridges()
    }
}

enum RunState {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Runs a `Broker` until stopped.
pub struct BrokerRunner {
    broker: Arc<Broker>,
    /// Source to watch for reloads, with the digest of the loaded document.
    metadata: Option<(MetadataSource, String)>,
    config: Config,
    state: Mutex<RunState>,
    cancel: CancellationToken,
}

impl BrokerRunner {
    /// Build a runner around an already constructed broker, without metadata reloading.
    pub fn new(config: Config, broker: Arc<Broker>) -> Self {
        Self {
            broker,
            metadata: None,
            config,
            state: Mutex::new(RunState::Idle),
            cancel: CancellationToken::new(),
        }
    }

    /// Read the metadata document named by `config` and assemble the broker.
    pub async fn load(config: Config) -> Result<Self, BrokerError> {
        let source = MetadataSource::new(config.metadata.path());
        let document = source.read().await?;
        let registry = Arc::new(RegistryProvider::from_document(&document)?);
        info!(path = %source.path().display(), "Loaded metadata");

        let broker = Arc::new(Broker::new(&config, registry));
        let mut runner = Self::new(config, broker);
        runner.metadata = Some((source, digest(&document)));
        Ok(runner)
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Start background tasks. A no-op when already running or stopped.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        if !matches!(*state, RunState::Idle) {
            debug!("Broker start ignored, not idle");
            return;
        }

        let mut tasks = vec![self.broker.watcher.spawn(self.cancel.child_token())];
        if let Some((source, seen)) = &self.metadata {
            if let Some(interval) = self.config.metadata.reload_interval() {
                let documents = source.watch(interval, Some(seen.clone()));
                tasks.push(
                    self.broker
                        .registry
                        .follow(documents, self.cancel.child_token()),
                );
            }
        }
        *state = RunState::Running(tasks);
        info!("Broker started");
    }

    /// Stop routing and release every call, bridge and task.
    ///
    /// Returns `true` for the one call that performed the stop.
    pub async fn stop(&self) -> bool {
        let tasks = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, RunState::Stopped) {
                RunState::Stopped => return false,
                RunState::Idle => Vec::new(),
                RunState::Running(tasks) => tasks,
            }
        };

        self.cancel.cancel();
        for bridge in self.broker.bridges() {
            bridge.shutdown();
        }
        self.broker.engine.shutdown();
        let released = self.broker.lifecycle.shutdown().await;
        for task in tasks {
            let _ = task.await;
        }

        info!(released_connections = released, "Broker stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*lock(&self.state), RunState::Stopped)
    }

    /// Start, wait for `shutdown`, then stop.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        self.start();
        tokio::select! {
            _ = shutdown => {}
            _ = self.cancel.cancelled() => {}
        }
        self.stop().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
