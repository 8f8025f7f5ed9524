//! JSON metadata document parsing.
//!
//! The document is deserialized into DTOs first, then linked into a
//! `Registry`. Linking fails on the first dangling reference or id collision;
//! nothing partially built ever escapes this module.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::trace;

use super::model::{
    Application, ConsumedMethod, ConsumedService, Message, Method, MethodType, ProvidedMethod,
    ProvidedService, Registry, Service,
};
use super::pattern::MatchPattern;

/// Errors raised while turning a metadata document into a `Registry`.
#[derive(Debug, thiserror::Error)]
pub enum RegistryFormatError {
    #[error("Malformed metadata document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate message id: {0}")]
    DuplicateMessage(String),

    #[error("Duplicate service id: {0}")]
    DuplicateService(String),

    #[error("Duplicate method '{method}' in service '{service}'")]
    DuplicateMethod { service: String, method: String },

    #[error("Duplicate application id: {0}")]
    DuplicateApplication(String),

    #[error("Method '{service}.{method}' references unknown message '{message}'")]
    UnknownMessage {
        service: String,
        method: String,
        message: String,
    },

    #[error("Application '{application}' references unknown service '{service}'")]
    UnknownService { application: String, service: String },

    #[error("Application '{application}' references unknown method '{service}.{method}'")]
    UnknownMethod {
        application: String,
        service: String,
        method: String,
    },

    #[error("Application '{application}' binds method '{service}.{method}' more than once")]
    DuplicateBinding {
        application: String,
        service: String,
        method: String,
    },

    #[error("Application '{application}' declares an empty match pattern for '{service}'")]
    InvalidPattern { application: String, service: String },
}

type Result<T> = std::result::Result<T, RegistryFormatError>;

#[derive(Debug, Deserialize)]
struct RegistryDto {
    #[serde(default)]
    messages: Option<Vec<MessageDto>>,
    #[serde(default)]
    services: Vec<ServiceDto>,
    #[serde(default)]
    applications: Vec<ApplicationDto>,
}

#[derive(Debug, Deserialize)]
struct MessageDto {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ServiceDto {
    id: String,
    #[serde(default)]
    methods: Vec<MethodDto>,
}

#[derive(Debug, Deserialize)]
struct MethodDto {
    name: String,
    input: String,
    output: String,
    #[serde(rename = "type")]
    method_type: MethodType,
}

#[derive(Debug, Deserialize)]
struct ApplicationDto {
    id: String,
    #[serde(default, alias = "consumed")]
    consumes: Vec<ConsumedServiceDto>,
    #[serde(default, alias = "provided")]
    provides: Vec<ProvidedServiceDto>,
}

#[derive(Debug, Deserialize)]
struct ConsumedServiceDto {
    service: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProvidedServiceDto {
    service: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    methods: Vec<ProvidedMethodDto>,
}

#[derive(Debug, Deserialize)]
struct ProvidedMethodDto {
    name: String,
    #[serde(default)]
    title: Option<String>,
}

/// Parse a JSON metadata document into a fully linked `Registry`.
pub fn parse(document: &[u8]) -> Result<Registry> {
    trace!(length = document.len(), "Parsing metadata document");
    let dto: RegistryDto = serde_json::from_slice(document)?;

    let messages = build_messages(&dto)?;
    let services = build_services(&dto.services, &messages)?;

    let mut applications = HashMap::with_capacity(dto.applications.len());
    for app_dto in &dto.applications {
        let application = build_application(app_dto, &services)?;
        match applications.entry(app_dto.id.clone()) {
            Entry::Occupied(_) => {
                return Err(RegistryFormatError::DuplicateApplication(app_dto.id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(application));
            }
        }
    }

    trace!(
        messages = messages.len(),
        services = services.len(),
        applications = applications.len(),
        "Linked metadata document"
    );
    Ok(Registry::from_parts(messages, services, applications))
}

/// Explicit message list when present; otherwise derived from method signatures.
fn build_messages(dto: &RegistryDto) -> Result<HashMap<String, Arc<Message>>> {
    let mut messages = HashMap::new();
    match &dto.messages {
        Some(declared) => {
            for message in declared {
                if messages
                    .insert(message.id.clone(), Arc::new(Message { id: message.id.clone() }))
                    .is_some()
                {
                    return Err(RegistryFormatError::DuplicateMessage(message.id.clone()));
                }
            }
        }
        None => {
            let referenced = dto
                .services
                .iter()
                .flat_map(|s| s.methods.iter())
                .flat_map(|m| [&m.input, &m.output]);
            for id in referenced {
                messages
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(Message { id: id.clone() }));
            }
        }
    }
    Ok(messages)
}

fn build_services(
    dtos: &[ServiceDto],
    messages: &HashMap<String, Arc<Message>>,
) -> Result<HashMap<String, Arc<Service>>> {
    let mut services = HashMap::with_capacity(dtos.len());
    for service_dto in dtos {
        let mut methods = HashMap::with_capacity(service_dto.methods.len());
        for method_dto in &service_dto.methods {
            let lookup = |message: &str| {
                messages
                    .get(message)
                    .cloned()
                    .ok_or_else(|| RegistryFormatError::UnknownMessage {
                        service: service_dto.id.clone(),
                        method: method_dto.name.clone(),
                        message: message.to_string(),
                    })
            };
            let method = Method {
                name: method_dto.name.clone(),
                service_id: service_dto.id.clone(),
                method_type: method_dto.method_type,
                input: lookup(&method_dto.input)?,
                output: lookup(&method_dto.output)?,
            };
            if methods
                .insert(method_dto.name.clone(), Arc::new(method))
                .is_some()
            {
                return Err(RegistryFormatError::DuplicateMethod {
                    service: service_dto.id.clone(),
                    method: method_dto.name.clone(),
                });
            }
        }

        let service = Service {
            id: service_dto.id.clone(),
            methods,
        };
        if services
            .insert(service_dto.id.clone(), Arc::new(service))
            .is_some()
        {
            return Err(RegistryFormatError::DuplicateService(service_dto.id.clone()));
        }
    }
    Ok(services)
}

fn build_application(
    dto: &ApplicationDto,
    services: &HashMap<String, Arc<Service>>,
) -> Result<Application> {
    let lookup_service = |service_id: &str| {
        services
            .get(service_id)
            .cloned()
            .ok_or_else(|| RegistryFormatError::UnknownService {
                application: dto.id.clone(),
                service: service_id.to_string(),
            })
    };
    let lookup_method = |service: &Service, name: &str| {
        service
            .method(name)
            .cloned()
            .ok_or_else(|| RegistryFormatError::UnknownMethod {
                application: dto.id.clone(),
                service: service.id.clone(),
                method: name.to_string(),
            })
    };
    let duplicate = |service: &Service, name: &str| RegistryFormatError::DuplicateBinding {
        application: dto.id.clone(),
        service: service.id.clone(),
        method: name.to_string(),
    };
    let pattern = |source: Option<&str>, service: &str| match source {
        None => Ok(MatchPattern::Any),
        Some(source) => {
            MatchPattern::parse(source).ok_or_else(|| RegistryFormatError::InvalidPattern {
                application: dto.id.clone(),
                service: service.to_string(),
            })
        }
    };

    let mut consumed_services = Vec::with_capacity(dto.consumes.len());
    for consumed in &dto.consumes {
        let service = lookup_service(&consumed.service)?;
        let mut methods = HashMap::with_capacity(consumed.methods.len());
        for name in &consumed.methods {
            let method = lookup_method(&service, name)?;
            if methods
                .insert(name.clone(), ConsumedMethod { method })
                .is_some()
            {
                return Err(duplicate(&service, name));
            }
        }
        consumed_services.push(ConsumedService {
            from: pattern(consumed.from.as_deref(), &service.id)?,
            service,
            application_id: dto.id.clone(),
            alias: consumed.alias.clone(),
            methods,
        });
    }

    let mut provided_services = Vec::with_capacity(dto.provides.len());
    for provided in &dto.provides {
        let service = lookup_service(&provided.service)?;
        let mut methods = HashMap::with_capacity(provided.methods.len());
        for method_dto in &provided.methods {
            let method = lookup_method(&service, &method_dto.name)?;
            let provided_method = ProvidedMethod {
                method,
                title: method_dto.title.clone(),
            };
            if methods
                .insert(method_dto.name.clone(), provided_method)
                .is_some()
            {
                return Err(duplicate(&service, &method_dto.name));
            }
        }
        provided_services.push(ProvidedService {
            to: pattern(provided.to.as_deref(), &service.id)?,
            service,
            application_id: dto.id.clone(),
            alias: provided.alias.clone(),
            methods,
        });
    }

    Ok(Application {
        id: dto.id.clone(),
        provided_services,
        consumed_services,
    })
}
