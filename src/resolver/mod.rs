//! Consumer -> provider resolution.
//!
//! A consumed service binds to a provided service only when both sides agree:
//! the provider's `to` pattern accepts the consumer application and the
//! consumer's `from` pattern accepts the provider application. Resolution is
//! pure; callers re-run it per call attempt against the live candidate set.

use std::fmt;

use crate::lifecycle::ConnectionId;
use crate::registry::{ConsumedService, ProvidedService};

/// A provided service offered by a (possibly connected) provider application.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub provided: &'a ProvidedService,
    /// Live connection backing this candidate, if any.
    pub connection_id: Option<ConnectionId>,
}

impl<'a> Candidate<'a> {
    pub fn new(provided: &'a ProvidedService, connection_id: Option<ConnectionId>) -> Self {
        Self {
            provided,
            connection_id,
        }
    }

    pub fn application_id(&self) -> &'a str {
        &self.provided.application_id
    }

    fn describe(&self) -> ProviderMatch {
        ProviderMatch {
            application_id: self.provided.application_id.clone(),
            alias: self.provided.alias.clone(),
            connection_id: self.connection_id,
        }
    }
}

/// Identity of a matching provider, reported in ambiguity errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMatch {
    pub application_id: String,
    pub alias: Option<String>,
    pub connection_id: Option<ConnectionId>,
}

impl fmt::Display for ProviderMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.application_id)?;
        if let Some(alias) = &self.alias {
            write!(f, " as {alias}")?;
        }
        if let Some(connection_id) = &self.connection_id {
            write!(f, " @{connection_id}")?;
        }
        Ok(())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolution failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error(
        "No provider of '{service}' matches consumer '{consumer}' (from: {from}; to patterns tried: [{}])",
        join(.to)
    )]
    NoMatch {
        service: String,
        consumer: String,
        from: String,
        to: Vec<String>,
    },

    #[error("Ambiguous providers of '{service}' for consumer '{consumer}': [{}]", join(.matches))]
    Ambiguous {
        service: String,
        consumer: String,
        matches: Vec<ProviderMatch>,
    },
}

/// Whether `provided` and `consumed` accept each other.
pub fn accepts(consumed: &ConsumedService, provided: &ProvidedService) -> bool {
    provided.service_id() == consumed.service_id()
        && provided.to.matches(&consumed.application_id)
        && consumed.from.matches(&provided.application_id)
}

/// Select the single provider satisfying `consumed`.
///
/// Returns `Ambiguous` listing every match when more than one remains; no
/// arbitrary choice is ever made.
pub fn resolve<'a>(
    consumed: &ConsumedService,
    candidates: impl IntoIterator<Item = Candidate<'a>>,
) -> Result<Candidate<'a>, ResolveError> {
    let mut attempted = Vec::new();
    let mut matches = Vec::new();

    for candidate in candidates {
        if candidate.provided.service_id() != consumed.service_id() {
            continue;
        }
        if accepts(consumed, candidate.provided) {
            matches.push(candidate);
        } else {
            attempted.push(candidate.provided.to.to_string());
        }
    }

    match matches.len() {
        0 => {
            attempted.sort();
            attempted.dedup();
            Err(ResolveError::NoMatch {
                service: consumed.service_id().to_string(),
                consumer: consumed.application_id.clone(),
                from: consumed.from.to_string(),
                to: attempted,
            })
        }
        1 => Ok(matches.remove(0)),
        _ => {
            let mut described: Vec<_> = matches.iter().map(Candidate::describe).collect();
            described.sort_by(|a, b| {
                (&a.application_id, a.connection_id).cmp(&(&b.application_id, b.connection_id))
            });
            Err(ResolveError::Ambiguous {
                service: consumed.service_id().to_string(),
                consumer: consumed.application_id.clone(),
                matches: described,
            })
        }
    }
}

#[cfg(test)]
mod tests;
