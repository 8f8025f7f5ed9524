//! Interop metadata registry.
//!
//! This module contains:
//! - `model`: the immutable registry graph (services, methods, applications, bindings)
//! - `pattern`: match patterns constraining which applications may bind
//! - `document`: JSON metadata parsing and linking
//! - `provider`: the live, atomically swapped current snapshot

pub mod document;
pub mod model;
pub mod pattern;
pub mod provider;

pub use document::{parse, RegistryFormatError};
pub use model::{
    Application, ConsumedMethod, ConsumedService, Message, Method, MethodType, ProvidedMethod,
    ProvidedService, Registry, Service,
};
pub use pattern::MatchPattern;
pub use provider::RegistryProvider;
