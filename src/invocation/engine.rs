//! Invocation engine.
//!
//! Routes a `CallTarget` to exactly one live provider connection, checks the
//! requested call shape against the registry, opens the transport call and
//! hands the caller a relay-backed handle. Failures are returned to the
//! caller; nothing here retries.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::relay::{ActiveCallGuard, ActiveCalls, Relay};
use super::{
    CallDescriptor, CallTarget, ClientStreamingCall, ConsumedMethodReference, DuplexCall,
    InvocationError, OpenCall, ProvidedMethodReference, ResponseStream,
};
use crate::config::InvocationConfig;
use crate::lifecycle::{AppConnection, AppLifecycleManager};
use crate::registry::{ConsumedService, Method, MethodType, Registry};
use crate::resolver::{self, Candidate};
use crate::transport::{Payload, TransportError};

/// Request side of a generic invocation.
pub enum CallInput {
    Single(Payload),
    Stream(BoxStream<'static, Payload>),
}

/// Response side of a generic invocation.
#[derive(Debug)]
pub enum CallOutput {
    Single(Payload),
    Stream(ResponseStream),
}

/// Routes and relays calls between connected applications.
pub struct InvocationEngine {
    lifecycle: Arc<AppLifecycleManager>,
    calls: Arc<ActiveCalls>,
    shutdown: CancellationToken,
    channel_capacity: usize,
}

impl InvocationEngine {
    pub fn new(lifecycle: Arc<AppLifecycleManager>, config: &InvocationConfig) -> Self {
        Self {
            lifecycle,
            calls: Arc::new(ActiveCalls::default()),
            shutdown: CancellationToken::new(),
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn lifecycle(&self) -> &Arc<AppLifecycleManager> {
        &self.lifecycle
    }

    /// Number of calls whose relay is still running.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Descriptors of the calls currently in flight.
    pub fn active_call_descriptors(&self) -> Vec<CallDescriptor> {
        self.calls.snapshot()
    }

    /// Cancel every in-flight call and refuse new ones.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(active = self.active_calls(), "Shutting down invocation engine");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Generic entry point: any call shape, payload or stream in, payload or stream out.
    ///
    /// The input shape must agree with `method_type`; a stream input on a
    /// method that takes one request (or the reverse) is a type mismatch.
    #[tracing::instrument(
        name = "invocation.invoke",
        skip(self, input),
        fields(service = %target.service_id(), method = %target.method())
    )]
    pub async fn invoke(
        &self,
        target: &CallTarget,
        method_type: MethodType,
        input: CallInput,
    ) -> Result<CallOutput, InvocationError> {
        let (descriptor, connection) = self.route(target, method_type).await?;

        // `method_type` agrees with the registry here; the input must match it too.
        let supplied = match (matches!(input, CallInput::Stream(_)), method_type.server_streams()) {
            (true, true) => MethodType::DuplexStreaming,
            (true, false) => MethodType::ClientStreaming,
            (false, true) => MethodType::ServerStreaming,
            (false, false) => MethodType::Unary,
        };
        check_method_type(&descriptor.method, supplied)?;

        let OpenCall {
            requests,
            responses,
            ..
        } = self.start(descriptor, connection).await?;

        match input {
            CallInput::Single(payload) => {
                requests.send(payload).await?;
                requests.complete();
            }
            CallInput::Stream(mut items) => {
                // Bounded by the call: the relay closes `requests` when it ends.
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = requests.closed() => break,
                            next = items.next() => match next {
                                Some(payload) => {
                                    if requests.send(payload).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                });
            }
        }

        if method_type.server_streams() {
            Ok(CallOutput::Stream(responses))
        } else {
            responses.single().await.map(CallOutput::Single)
        }
    }

    pub async fn call_unary(
        &self,
        target: &CallTarget,
        request: Payload,
    ) -> Result<Payload, InvocationError> {
        let call = self.open(target, MethodType::Unary).await?;
        call.requests.send(request).await?;
        call.requests.complete();
        call.responses.single().await
    }

    pub async fn call_client_streaming(
        &self,
        target: &CallTarget,
    ) -> Result<ClientStreamingCall, InvocationError> {
        self.open(target, MethodType::ClientStreaming)
            .await
            .map(ClientStreamingCall::from)
    }

    pub async fn call_server_streaming(
        &self,
        target: &CallTarget,
        request: Payload,
    ) -> Result<ResponseStream, InvocationError> {
        let call = self.open(target, MethodType::ServerStreaming).await?;
        call.requests.send(request).await?;
        call.requests.complete();
        Ok(call.responses)
    }

    pub async fn call_duplex(&self, target: &CallTarget) -> Result<DuplexCall, InvocationError> {
        self.open(target, MethodType::DuplexStreaming)
            .await
            .map(DuplexCall::from)
    }

    /// Route `target`, verify `method_type` and open the transport call.
    ///
    /// The declared type is checked before any transport call is opened.
    pub async fn open(
        &self,
        target: &CallTarget,
        method_type: MethodType,
    ) -> Result<OpenCall, InvocationError> {
        let (descriptor, connection) = self.route(target, method_type).await?;
        self.start(descriptor, connection).await
    }

    /// Resolve `target` to a live connection and check the declared method type.
    async fn route(
        &self,
        target: &CallTarget,
        method_type: MethodType,
    ) -> Result<(CallDescriptor, AppConnection), InvocationError> {
        if self.shutdown.is_cancelled() {
            return Err(InvocationError::ShuttingDown);
        }

        let registry = self.lifecycle.registry().current();
        match target {
            CallTarget::Consumed(reference) => {
                self.route_consumed(&registry, reference, method_type).await
            }
            CallTarget::Provided(reference) => {
                self.route_provided(&registry, reference, method_type).await
            }
        }
    }

    /// Open the transport call and spawn its relay.
    async fn start(
        &self,
        descriptor: CallDescriptor,
        connection: AppConnection,
    ) -> Result<OpenCall, InvocationError> {
        let transport = connection
            .transport
            .open_call(&descriptor)
            .await
            .map_err(|e| match e {
                TransportError::Cancelled => InvocationError::CallCancelled,
                other => InvocationError::CallFailed(other.to_string()),
            })?;

        let guard: ActiveCallGuard = self.calls.register(&descriptor);
        let (relay, call) = Relay::new(
            descriptor,
            connection.watch_state(),
            self.shutdown.child_token(),
            transport,
            guard,
            self.channel_capacity,
        );
        debug!(call = %call.descriptor, call_id = %call.descriptor.call_id, "Call opened");
        tokio::spawn(relay.run());
        Ok(call)
    }

    async fn route_consumed(
        &self,
        registry: &Arc<Registry>,
        reference: &ConsumedMethodReference,
        method_type: MethodType,
    ) -> Result<(CallDescriptor, AppConnection), InvocationError> {
        let consumer = self
            .lifecycle
            .connection(reference.consumer)
            .await
            .ok_or(InvocationError::UnknownConnection(reference.consumer))?;
        let application = registry
            .application(&consumer.descriptor.application_id)
            .ok_or_else(|| {
                InvocationError::UnknownApplication(consumer.descriptor.application_id.clone())
            })?;

        let consumed = select_consumed(
            application.consumed(&reference.service_id),
            reference,
            &application.id,
        )?;
        let method = consumed
            .method(&reference.method)
            .map(|consumed_method| Arc::clone(&consumed_method.method))
            .ok_or_else(|| InvocationError::MethodNotFound {
                service: reference.service_id.clone(),
                method: reference.method.clone(),
            })?;
        check_method_type(&method, method_type)?;

        // Resolution always runs against the live set, never a cached binding.
        let live = self.lifecycle.list_connected().await;
        let candidates = live
            .iter()
            .filter(|c| {
                reference
                    .application_id
                    .as_ref()
                    .map_or(true, |app| *app == c.application_id)
            })
            .filter(|c| reference.connection_id.map_or(true, |id| id == c.connection_id))
            .filter_map(|c| {
                registry
                    .application(&c.application_id)
                    .map(|app| (app, c.connection_id))
            })
            .flat_map(|(app, connection_id)| {
                app.provided(&reference.service_id)
                    .filter(|provided| provided.method(&reference.method).is_some())
                    .map(move |provided| Candidate::new(provided, Some(connection_id)))
            });

        let chosen = match resolver::resolve(consumed, candidates) {
            Ok(chosen) => chosen,
            Err(e) => {
                warn!(
                    consumer = %consumer.descriptor.application_id,
                    service = %reference.service_id,
                    error = %e,
                    "Resolution failed"
                );
                return Err(e.into());
            }
        };
        let Some(connection_id) = chosen.connection_id else {
            return Err(InvocationError::CallFailed(format!(
                "provider '{}' has no live connection",
                chosen.application_id()
            )));
        };

        // The snapshot may be stale; a vanished provider is a routing failure.
        let connection = self
            .lifecycle
            .connection(connection_id)
            .await
            .ok_or(InvocationError::UnknownConnection(connection_id))?;

        let descriptor = CallDescriptor {
            call_id: Uuid::new_v4(),
            method,
            consumer: Some(consumer.descriptor),
            target: connection.descriptor.clone(),
            registry: Arc::clone(registry),
        };
        Ok((descriptor, connection))
    }

    async fn route_provided(
        &self,
        registry: &Arc<Registry>,
        reference: &ProvidedMethodReference,
        method_type: MethodType,
    ) -> Result<(CallDescriptor, AppConnection), InvocationError> {
        let application = registry
            .application(&reference.application_id)
            .ok_or_else(|| InvocationError::UnknownApplication(reference.application_id.clone()))?;
        let mut bindings = application.provided(&reference.service_id).peekable();
        if bindings.peek().is_none() {
            return Err(InvocationError::ServiceNotProvided {
                application: reference.application_id.clone(),
                service: reference.service_id.clone(),
            });
        }
        // The service may be provided under several aliases; any binding may carry the method.
        let method = bindings
            .find_map(|provided| provided.method(&reference.method))
            .map(|provided_method| Arc::clone(&provided_method.method))
            .ok_or_else(|| InvocationError::MethodNotFound {
                service: reference.service_id.clone(),
                method: reference.method.clone(),
            })?;
        check_method_type(&method, method_type)?;

        let connection = self
            .lifecycle
            .connection(reference.connection_id)
            .await
            .filter(|c| c.descriptor.application_id == reference.application_id)
            .ok_or(InvocationError::UnknownConnection(reference.connection_id))?;

        let descriptor = CallDescriptor {
            call_id: Uuid::new_v4(),
            method,
            consumer: None,
            target: connection.descriptor.clone(),
            registry: Arc::clone(registry),
        };
        Ok((descriptor, connection))
    }
}

impl std::fmt::Debug for InvocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationEngine")
            .field("active_calls", &self.active_calls())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

fn check_method_type(method: &Method, requested: MethodType) -> Result<(), InvocationError> {
    if method.method_type == requested {
        return Ok(());
    }
    Err(InvocationError::MethodTypeMismatch {
        service: method.service_id.clone(),
        method: method.name.clone(),
        declared: method.method_type,
        requested,
    })
}

/// Pick the consumed binding a reference addresses.
fn select_consumed<'a>(
    bindings: impl Iterator<Item = &'a ConsumedService>,
    reference: &ConsumedMethodReference,
    application_id: &str,
) -> Result<&'a ConsumedService, InvocationError> {
    let mut matching = bindings.filter(|binding| match &reference.service_alias {
        Some(alias) => binding.alias.as_deref() == Some(alias.as_str()),
        None => true,
    });
    let first = matching
        .next()
        .ok_or_else(|| InvocationError::ServiceNotConsumed {
            application: application_id.to_string(),
            service: reference.service_id.clone(),
        })?;
    if matching.next().is_some() {
        return Err(InvocationError::AliasRequired {
            application: application_id.to_string(),
            service: reference.service_id.clone(),
        });
    }
    Ok(first)
}
