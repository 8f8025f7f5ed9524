//! Live registry provider.
//!
//! Holds the current snapshot behind an `ArcSwap` so readers never lock, and
//! publishes every successful reload on a broadcast channel.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::document::{parse, RegistryFormatError};
use super::model::Registry;

/// Pending snapshots buffered per subscriber.
const UPDATE_CAPACITY: usize = 16;

/// Source of registry snapshots.
pub struct RegistryProvider {
    current: ArcSwap<Registry>,
    updates: broadcast::Sender<Arc<Registry>>,
    /// Serializes store+publish so subscribers see reloads in swap order.
    reload_lock: Mutex<()>,
}

impl RegistryProvider {
    /// Create a provider serving `initial` until the first reload.
    pub fn new(initial: Registry) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            current: ArcSwap::from_pointee(initial),
            updates,
            reload_lock: Mutex::new(()),
        }
    }

    /// Create a provider from the initial metadata document.
    pub fn from_document(document: &[u8]) -> Result<Self, RegistryFormatError> {
        let registry = parse(document)?;
        info!(
            services = registry.services.len(),
            applications = registry.applications.len(),
            "Loaded registry"
        );
        Ok(Self::new(registry))
    }

    /// Latest successfully parsed snapshot.
    pub fn current(&self) -> Arc<Registry> {
        self.current.load_full()
    }

    /// Parse `document` and, on success, make it the current snapshot.
    ///
    /// A failed parse leaves the current snapshot untouched and emits nothing.
    pub fn reload(&self, document: &[u8]) -> Result<Arc<Registry>, RegistryFormatError> {
        let registry = match parse(document) {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                warn!(error = %e, "Rejected metadata reload, keeping current registry");
                return Err(e);
            }
        };

        {
            let _guard = self
                .reload_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.current.store(Arc::clone(&registry));
            let receivers = self.updates.send(Arc::clone(&registry)).unwrap_or(0);
            debug!(receivers, "Published registry snapshot");
        }

        info!(
            services = registry.services.len(),
            applications = registry.applications.len(),
            "Reloaded registry"
        );
        Ok(registry)
    }

    /// Stream of snapshots: the current one immediately, then each reload in order.
    pub fn subscribe(&self) -> BoxStream<'static, Arc<Registry>> {
        // Subscribe before sampling `current` so no reload falls in between.
        let receiver = self.updates.subscribe();
        let first = self.current();

        let updates = BroadcastStream::new(receiver).filter_map(|item| async move {
            match item {
                Ok(registry) => Some(registry),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Registry subscriber lagged, skipped snapshots");
                    None
                }
            }
        });

        stream::once(async move { first })
            .chain(updates)
            .scan(None::<Arc<Registry>>, |last, registry| {
                let repeated = last
                    .as_ref()
                    .is_some_and(|previous| Arc::ptr_eq(previous, &registry));
                *last = Some(Arc::clone(&registry));
                let next = if repeated { None } else { Some(registry) };
                async move { Some(next) }
            })
            .filter_map(|next| async move { next })
            .boxed()
    }

    /// Feed raw documents into `reload` until the stream ends or `cancel` fires.
    pub fn follow<S>(self: &Arc<Self>, documents: S, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            let mut documents = Box::pin(documents);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Registry follower cancelled");
                        break;
                    }
                    next = documents.next() => match next {
                        Some(document) => {
                            // Errors are logged by reload; the previous snapshot keeps serving.
                            let _ = provider.reload(&document);
                        }
                        None => {
                            debug!("Metadata document stream ended");
                            break;
                        }
                    }
                }
            }
        })
    }
}
