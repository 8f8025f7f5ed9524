//! Immutable registry graph.
//!
//! A `Registry` is built once per metadata load and shared behind an `Arc`.
//! Forward references (method -> message, binding -> service) are `Arc`s into
//! the same snapshot; back references (binding -> application) are ids.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pattern::MatchPattern;

/// Shape of a method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodType {
    /// Whether the caller sends a stream of requests.
    pub fn client_streams(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::DuplexStreaming)
    }

    /// Whether the provider answers with a stream of responses.
    pub fn server_streams(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::DuplexStreaming)
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unary => "Unary",
            Self::ClientStreaming => "ClientStreaming",
            Self::ServerStreaming => "ServerStreaming",
            Self::DuplexStreaming => "DuplexStreaming",
        };
        f.write_str(name)
    }
}

/// Named message schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
}

/// A method owned by a service.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    /// Id of the owning service.
    pub service_id: String,
    pub method_type: MethodType,
    pub input: Arc<Message>,
    pub output: Arc<Message>,
}

/// A service definition with its methods keyed by name.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub methods: HashMap<String, Arc<Method>>,
}

impl Service {
    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.get(name)
    }
}

/// A method exposed by a provided service.
#[derive(Debug, Clone)]
pub struct ProvidedMethod {
    pub method: Arc<Method>,
    pub title: Option<String>,
}

/// A method required by a consumed service.
#[derive(Debug, Clone)]
pub struct ConsumedMethod {
    pub method: Arc<Method>,
}

/// A service an application offers, restricted to consumers matching `to`.
#[derive(Debug, Clone)]
pub struct ProvidedService {
    pub service: Arc<Service>,
    pub application_id: String,
    pub alias: Option<String>,
    pub to: MatchPattern,
    pub methods: HashMap<String, ProvidedMethod>,
}

impl ProvidedService {
    pub fn service_id(&self) -> &str {
        &self.service.id
    }

    pub fn method(&self, name: &str) -> Option<&ProvidedMethod> {
        self.methods.get(name)
    }
}

/// A service an application depends on, satisfiable by providers matching `from`.
#[derive(Debug, Clone)]
pub struct ConsumedService {
    pub service: Arc<Service>,
    pub application_id: String,
    pub alias: Option<String>,
    pub from: MatchPattern,
    pub methods: HashMap<String, ConsumedMethod>,
}

impl ConsumedService {
    pub fn service_id(&self) -> &str {
        &self.service.id
    }

    pub fn method(&self, name: &str) -> Option<&ConsumedMethod> {
        self.methods.get(name)
    }
}

/// An application and its declared service bindings.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: String,
    pub provided_services: Vec<ProvidedService>,
    pub consumed_services: Vec<ConsumedService>,
}

impl Application {
    /// Provided bindings for a service id.
    pub fn provided(&self, service_id: &str) -> impl Iterator<Item = &ProvidedService> {
        let service_id = service_id.to_string();
        self.provided_services
            .iter()
            .filter(move |p| p.service_id() == service_id)
    }

    /// Consumed bindings for a service id.
    pub fn consumed(&self, service_id: &str) -> impl Iterator<Item = &ConsumedService> {
        let service_id = service_id.to_string();
        self.consumed_services
            .iter()
            .filter(move |c| c.service_id() == service_id)
    }
}

/// Service id -> application ids, built once per snapshot.
#[derive(Debug, Clone, Default)]
pub struct CapabilityIndex {
    providers: HashMap<String, BTreeSet<String>>,
    consumers: HashMap<String, BTreeSet<String>>,
}

impl CapabilityIndex {
    fn build<'a>(applications: impl IntoIterator<Item = &'a Arc<Application>>) -> Self {
        let mut index = Self::default();
        for app in applications {
            for provided in &app.provided_services {
                index
                    .providers
                    .entry(provided.service_id().to_string())
                    .or_default()
                    .insert(app.id.clone());
            }
            for consumed in &app.consumed_services {
                index
                    .consumers
                    .entry(consumed.service_id().to_string())
                    .or_default()
                    .insert(app.id.clone());
            }
        }
        index
    }
}

/// Immutable snapshot of the metadata graph.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub messages: HashMap<String, Arc<Message>>,
    pub services: HashMap<String, Arc<Service>>,
    pub applications: HashMap<String, Arc<Application>>,
    capabilities: CapabilityIndex,
}

impl Registry {
    /// Assemble a snapshot from already-linked parts.
    pub(crate) fn from_parts(
        messages: HashMap<String, Arc<Message>>,
        services: HashMap<String, Arc<Service>>,
        applications: HashMap<String, Arc<Application>>,
    ) -> Self {
        let capabilities = CapabilityIndex::build(applications.values());
        Self {
            messages,
            services,
            applications,
            capabilities,
        }
    }

    pub fn application(&self, id: &str) -> Option<&Arc<Application>> {
        self.applications.get(id)
    }

    pub fn service(&self, id: &str) -> Option<&Arc<Service>> {
        self.services.get(id)
    }

    pub fn message(&self, id: &str) -> Option<&Arc<Message>> {
        self.messages.get(id)
    }

    /// Whether `application_id` declares a provided binding for `service_id`.
    pub fn is_provider(&self, application_id: &str, service_id: &str) -> bool {
        self.capabilities
            .providers
            .get(service_id)
            .is_some_and(|apps| apps.contains(application_id))
    }

    /// Whether `application_id` declares a consumed binding for `service_id`.
    pub fn is_consumer(&self, application_id: &str, service_id: &str) -> bool {
        self.capabilities
            .consumers
            .get(service_id)
            .is_some_and(|apps| apps.contains(application_id))
    }

    /// Application ids providing `service_id`, in id order.
    pub fn providers_of(&self, service_id: &str) -> impl Iterator<Item = &str> {
        self.capabilities
            .providers
            .get(service_id)
            .into_iter()
            .flat_map(|apps| apps.iter().map(String::as_str))
    }
}
