//! Connection transport abstraction.
//!
//! The broker never frames or encodes messages itself. Each connection hands
//! the lifecycle manager a `ConnectionTransport` able to open a call against
//! the remote peer; payloads are opaque bytes.
//!
//! Supports:
//! - `memory`: in-process loopback where a `CallHandler` plays the provider

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::invocation::CallDescriptor;

pub mod memory;

/// Opaque message payload.
pub type Payload = Bytes;

/// Inbound items of an opened call.
pub type TransportStream = BoxStream<'static, Result<Payload, TransportError>>;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Call cancelled by peer")]
    Cancelled,

    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Both directions of a call opened against a peer.
///
/// Dropping `requests` tells the peer the caller has finished sending.
/// Dropping `responses` abandons the call.
pub struct TransportCall {
    pub requests: mpsc::Sender<Payload>,
    pub responses: TransportStream,
}

impl std::fmt::Debug for TransportCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCall")
            .field("requests_closed", &self.requests.is_closed())
            .finish_non_exhaustive()
    }
}

/// Per-connection ability to open calls on the remote application.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    async fn open_call(&self, descriptor: &CallDescriptor) -> Result<TransportCall, TransportError>;
}
