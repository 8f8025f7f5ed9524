//! Call routing and invocation.
//!
//! This module contains:
//! - `CallTarget`: how a caller addresses a method (consumed binding or provider directly)
//! - `CallDescriptor`: the resolved per-call address
//! - `engine`: routing, validation and call opening
//! - `relay`: the per-call task moving items between caller and transport

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::lifecycle::{AppConnectionDescriptor, ConnectionId};
use crate::registry::{Method, MethodType, Registry};
use crate::resolver::ResolveError;

pub mod engine;
pub mod relay;

pub use engine::{CallInput, CallOutput, InvocationEngine};
pub use relay::{ClientStreamingCall, DuplexCall, OpenCall, RequestSender, ResponseStream};

/// Routing and call failures surfaced to the caller of `invoke`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Application '{0}' is not declared in the registry")]
    UnknownApplication(String),

    #[error("Application '{application}' does not consume '{service}'")]
    ServiceNotConsumed { application: String, service: String },

    #[error("Application '{application}' consumes '{service}' more than once; an alias is required")]
    AliasRequired { application: String, service: String },

    #[error("Application '{application}' does not provide '{service}'")]
    ServiceNotProvided { application: String, service: String },

    #[error("Method '{method}' is not declared on '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("Method '{service}/{method}' is {declared}, called as {requested}")]
    MethodTypeMismatch {
        service: String,
        method: String,
        declared: MethodType,
        requested: MethodType,
    },

    #[error("Call failed: {0}")]
    CallFailed(String),

    #[error("Call cancelled")]
    CallCancelled,

    #[error("Invocation engine is shutting down")]
    ShuttingDown,
}

impl InvocationError {
    /// Failures raised while routing, before any transport call was opened.
    pub fn is_routing_error(&self) -> bool {
        !matches!(
            self,
            Self::CallFailed(_) | Self::CallCancelled | Self::ShuttingDown
        )
    }
}

/// A consumed method, as a consumer application refers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMethodReference {
    /// Connection of the calling consumer.
    pub consumer: ConnectionId,
    pub service_id: String,
    /// Selects among several consumed bindings of the same service.
    pub service_alias: Option<String>,
    pub method: String,
    /// Narrow resolution to one provider application.
    pub application_id: Option<String>,
    /// Narrow resolution to one provider connection.
    pub connection_id: Option<ConnectionId>,
}

impl ConsumedMethodReference {
    pub fn new(consumer: ConnectionId, service_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            consumer,
            service_id: service_id.into(),
            service_alias: None,
            method: method.into(),
            application_id: None,
            connection_id: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.service_alias = Some(alias.into());
        self
    }

    pub fn with_application(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }
}

/// A provided method on a specific live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidedMethodReference {
    pub service_id: String,
    pub method: String,
    pub application_id: String,
    pub connection_id: ConnectionId,
}

impl ProvidedMethodReference {
    pub fn new(
        service_id: impl Into<String>,
        method: impl Into<String>,
        target: &AppConnectionDescriptor,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            method: method.into(),
            application_id: target.application_id.clone(),
            connection_id: target.connection_id,
        }
    }
}

/// How a call is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// Resolve a consumer's declared dependency against live providers.
    Consumed(ConsumedMethodReference),
    /// Call a provider connection directly.
    Provided(ProvidedMethodReference),
}

impl CallTarget {
    pub fn service_id(&self) -> &str {
        match self {
            Self::Consumed(reference) => &reference.service_id,
            Self::Provided(reference) => &reference.service_id,
        }
    }

    pub fn method(&self) -> &str {
        match self {
            Self::Consumed(reference) => &reference.method,
            Self::Provided(reference) => &reference.method,
        }
    }
}

impl From<ConsumedMethodReference> for CallTarget {
    fn from(reference: ConsumedMethodReference) -> Self {
        Self::Consumed(reference)
    }
}

impl From<ProvidedMethodReference> for CallTarget {
    fn from(reference: ProvidedMethodReference) -> Self {
        Self::Provided(reference)
    }
}

/// Resolved address of one call. Lives as long as the call.
///
/// Holds the registry snapshot the call was routed against, so method
/// metadata stays valid across reloads.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub call_id: Uuid,
    pub method: Arc<Method>,
    /// Calling consumer, absent for broker-internal calls.
    pub consumer: Option<AppConnectionDescriptor>,
    pub target: AppConnectionDescriptor,
    pub registry: Arc<Registry>,
}

impl CallDescriptor {
    pub fn service_id(&self) -> &str {
        &self.method.service_id
    }

    pub fn method_name(&self) -> &str {
        &self.method.name
    }

    pub fn method_type(&self) -> MethodType {
        self.method.method_type
    }

    pub fn application_id(&self) -> &str {
        &self.target.application_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.target.connection_id
    }
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}@{}",
            self.service_id(),
            self.method_name(),
            self.target.application_id,
            self.target.connection_id
        )
    }
}
