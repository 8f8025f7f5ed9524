use super::*;
use crate::lifecycle::ConnectionId;
use crate::registry::{parse, Registry};

/// `app.c` consumes svc.S from `vendor.*`; three providers with varying `to` patterns.
const DOCUMENT: &str = r#"{
  "services": [
    { "id": "svc.S", "methods": [ { "name": "m", "input": "In", "output": "Out", "type": "Unary" } ] },
    { "id": "svc.T", "methods": [ { "name": "m", "input": "In", "output": "Out", "type": "Unary" } ] }
  ],
  "applications": [
    { "id": "app.c", "consumes": [ { "service": "svc.S", "from": "vendor.*", "methods": ["m"] } ] },
    { "id": "vendor.a", "provides": [ { "service": "svc.S", "to": "app.c", "methods": [ { "name": "m" } ] } ] },
    { "id": "vendor.b", "provides": [ { "service": "svc.S", "to": "*", "methods": [ { "name": "m" } ] } ] },
    { "id": "vendor.closed", "provides": [ { "service": "svc.S", "to": "app.other", "methods": [ { "name": "m" } ] } ] },
    { "id": "other.d", "provides": [ { "service": "svc.S", "to": "*", "methods": [ { "name": "m" } ] } ] },
    { "id": "vendor.t", "provides": [ { "service": "svc.T", "to": "*", "methods": [ { "name": "m" } ] } ] }
  ]
}"#;

fn registry() -> Registry {
    parse(DOCUMENT.as_bytes()).unwrap()
}

fn consumed(registry: &Registry) -> &ConsumedService {
    &registry.application("app.c").unwrap().consumed_services[0]
}

fn provided<'a>(registry: &'a Registry, app: &str) -> &'a ProvidedService {
    &registry.application(app).unwrap().provided_services[0]
}

fn candidate<'a>(registry: &'a Registry, app: &str) -> Candidate<'a> {
    Candidate::new(provided(registry, app), Some(ConnectionId::new()))
}

#[test]
fn test_single_match_resolves() {
    let registry = registry();
    let candidates = vec![
        candidate(&registry, "vendor.a"),
        candidate(&registry, "vendor.closed"),
        candidate(&registry, "other.d"),
        candidate(&registry, "vendor.t"),
    ];

    let resolved = resolve(consumed(&registry), candidates).unwrap();
    assert_eq!(resolved.application_id(), "vendor.a");
}

#[test]
fn test_multiple_matches_are_ambiguous() {
    let registry = registry();
    let candidates = vec![candidate(&registry, "vendor.b"), candidate(&registry, "vendor.a")];

    let err = resolve(consumed(&registry), candidates).unwrap_err();
    match err {
        ResolveError::Ambiguous {
            service, matches, ..
        } => {
            assert_eq!(service, "svc.S");
            let apps: Vec<_> = matches.iter().map(|m| m.application_id.as_str()).collect();
            assert_eq!(apps, vec!["vendor.a", "vendor.b"]);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn test_same_application_on_two_connections_is_ambiguous() {
    let registry = registry();
    let candidates = vec![candidate(&registry, "vendor.a"), candidate(&registry, "vendor.a")];

    assert!(matches!(
        resolve(consumed(&registry), candidates),
        Err(ResolveError::Ambiguous { ref matches, .. }) if matches.len() == 2
    ));
}

#[test]
fn test_no_match_reports_patterns() {
    let registry = registry();
    let candidates = vec![
        candidate(&registry, "vendor.closed"),
        candidate(&registry, "other.d"),
    ];

    let err = resolve(consumed(&registry), candidates).unwrap_err();
    match err {
        ResolveError::NoMatch {
            service, from, to, ..
        } => {
            assert_eq!(service, "svc.S");
            assert_eq!(from, "vendor.*");
            assert_eq!(to, vec!["*".to_string(), "app.other".to_string()]);
        }
        other => panic!("expected no match, got {other:?}"),
    }
}

#[test]
fn test_acceptance_is_bidirectional() {
    let registry = registry();
    let consumer = consumed(&registry);

    // `to` accepts app.c but app.c's `from` rejects other.d.
    assert!(!accepts(consumer, provided(&registry, "other.d")));
    // app.c's `from` accepts vendor.closed but its `to` rejects app.c.
    assert!(!accepts(consumer, provided(&registry, "vendor.closed")));
    assert!(accepts(consumer, provided(&registry, "vendor.b")));
    // Different service never binds.
    assert!(!accepts(consumer, provided(&registry, "vendor.t")));
}

#[test]
fn test_resolution_is_idempotent() {
    let registry = registry();
    let candidates = vec![
        candidate(&registry, "vendor.a"),
        candidate(&registry, "other.d"),
    ];

    let first = resolve(consumed(&registry), candidates.clone()).unwrap();
    let second = resolve(consumed(&registry), candidates).unwrap();
    assert_eq!(first.application_id(), second.application_id());
    assert_eq!(first.connection_id, second.connection_id);

    let ambiguous = vec![candidate(&registry, "vendor.a"), candidate(&registry, "vendor.b")];
    let first = resolve(consumed(&registry), ambiguous.clone()).unwrap_err();
    let second = resolve(consumed(&registry), ambiguous).unwrap_err();
    assert_eq!(first.to_string(), second.to_string());
}

#[test]
fn test_empty_candidate_set() {
    let registry = registry();
    let err = resolve(consumed(&registry), Vec::new()).unwrap_err();
    assert!(matches!(err, ResolveError::NoMatch { ref to, .. } if to.is_empty()));
}
