//! Metadata document source.
//!
//! Reads the registry document from disk and watches it for changes by
//! polling and comparing content digests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Failed to read metadata document {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Hex-encoded SHA-256 of a document.
pub fn digest(document: &[u8]) -> String {
    hex::encode(Sha256::digest(document))
}

/// The registry document on disk.
#[derive(Debug, Clone)]
pub struct MetadataSource {
    path: PathBuf,
}

impl MetadataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<Vec<u8>, MetadataError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| MetadataError::Read {
                path: self.path.clone(),
                source,
            })
    }

    /// Documents whose content differs from the last one seen.
    ///
    /// `seen` is the digest of the document already loaded, if any. Read
    /// errors are logged and polling continues.
    pub fn watch(&self, interval: Duration, seen: Option<String>) -> BoxStream<'static, Vec<u8>> {
        watch(self.path.clone(), interval, seen)
    }
}

/// Poll `path` every `interval`, yielding its content whenever the digest changes.
pub fn watch(path: PathBuf, interval: Duration, seen: Option<String>) -> BoxStream<'static, Vec<u8>> {
    stream::unfold((path, seen), move |(path, mut seen)| async move {
        loop {
            tokio::time::sleep(interval).await;
            let document = match tokio::fs::read(&path).await {
                Ok(document) => document,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to poll metadata document");
                    continue;
                }
            };
            let current = digest(&document);
            if seen.as_deref() == Some(current.as_str()) {
                continue;
            }
            debug!(path = %path.display(), digest = %current, "Metadata document changed");
            seen = Some(current);
            return Some((document, (path, seen)));
        }
    })
    .boxed()
}
