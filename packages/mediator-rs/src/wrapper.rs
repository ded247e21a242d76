//! Per-type dispatch wrappers and the cache that memoizes them.
//!
//! A wrapper is everything needed to dispatch one concrete message type:
//! the resolved handler(s) with the behavior chain already composed around
//! them. Wrappers are built lazily on the first dispatch of a type and
//! reused for the life of the mediator.
//!
//! # Architecture
//!
//! ```text
//! send(Ping) ──┐
//!              ├─► WrapperCache[TypeId(Ping)] ──hit──► RequestWrapper<Ping>
//! send_any ────┘          │                              └─ composed chain
//!                         miss
//!                         ▼
//!               build_request_wrapper::<Ping>(registry, config)
//! ```
//!
//! The typed path calls the generic build function directly. The dynamic
//! path only has a `TypeId`, so it looks up the build function the registry
//! recorded for that type when its handler was registered.
//!
//! # Concurrency
//!
//! The cache is a `DashMap`. A miss builds outside any shard lock, then
//! inserts through `entry().or_insert()`: when several callers race on the
//! first dispatch of a type, the first insert wins and everyone returns that
//! instance. Losing builds are discarded. Building only reads the registry,
//! so a discarded build leaves nothing behind.
//!
//! Build failures are not cached. A type with no handler fails on every
//! dispatch until a mediator with a handler for it is built.

use std::any::{Any, TypeId};
use std::sync::Arc;

use anyhow::Result;
use async_stream::stream;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::MediatorConfig;
use crate::core::{
    AnyItem, AnyMessage, AnyResponse, MessageType, Notification, Request, StreamRequest,
};
use crate::error::MediatorError;
use crate::exception::{exception_stages, ExceptionActionBinding, ExceptionHandlerBinding};
use crate::handler::{NotificationHandler, RequestHandler, StreamRequestHandler};
use crate::pipeline::{
    compose, PipelineBehavior, PostProcessorBehavior, PreProcessorBehavior, RequestPostProcessor,
    RequestPreProcessor, Stage,
};
use crate::publish::NotificationHandlerExecutor;
use crate::registry::{Binding, ServiceRegistry};
use crate::stream::{compose_stream, StreamPipelineBehavior, StreamStage};

// =============================================================================
// Cache
// =============================================================================

/// Memoizes one wrapper per concrete message type.
pub(crate) struct WrapperCache<W: ?Sized> {
    entries: DashMap<TypeId, Arc<W>>,
}

impl<W: ?Sized + Send + Sync> WrapperCache<W> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the cached wrapper for `type_id`, building it on a miss.
    ///
    /// A failed build is returned to the caller and not remembered.
    pub(crate) fn get_or_build<F>(&self, type_id: TypeId, build: F) -> Result<Arc<W>>
    where
        F: FnOnce() -> Result<Arc<W>>,
    {
        if let Some(existing) = self.get(type_id) {
            return Ok(existing);
        }

        let built = build()?;
        let winner = self
            .entries
            .entry(type_id)
            .or_insert(built.clone())
            .value()
            .clone();

        if !Arc::ptr_eq(&winner, &built) {
            debug!("concurrent wrapper build lost the race, reusing the cached wrapper");
        }
        Ok(winner)
    }

    /// The cached wrapper for `type_id`, without building.
    pub(crate) fn get(&self, type_id: TypeId) -> Option<Arc<W>> {
        self.entries.get(&type_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<W: ?Sized> std::fmt::Debug for WrapperCache<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapperCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Request Wrappers
// =============================================================================

/// Type-erased view of a [`RequestWrapper`].
pub(crate) trait ErasedRequestWrapper: Send + Sync {
    /// Recover the typed wrapper.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Dispatch an erased request, downcasting it to the wrapper's type.
    fn handle_any(
        &self,
        request: AnyMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AnyResponse>>;
}

/// Dispatch entry point for request type `R`.
pub(crate) struct RequestWrapper<R: Request> {
    chain: Arc<dyn Stage<R>>,
}

impl<R: Request> RequestWrapper<R> {
    pub(crate) async fn handle(
        &self,
        request: &R,
        cancel: CancellationToken,
    ) -> Result<R::Response> {
        trace!(request_type = std::any::type_name::<R>(), "dispatching request");
        self.chain.invoke(request, cancel).await
    }
}

impl<R: Request> ErasedRequestWrapper for RequestWrapper<R> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn handle_any(
        &self,
        request: AnyMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AnyResponse>> {
        Box::pin(async move {
            let request = request
                .downcast::<R>()
                .map_err(|_| MediatorError::MessageTypeMismatch {
                    expected: std::any::type_name::<R>(),
                })?;
            let response = self.handle(&request, cancel).await?;
            Ok(Box::new(response) as AnyResponse)
        })
    }
}

/// Builds the wrapper for a request type. Recorded per type by the registry.
pub(crate) type BuildRequestWrapper =
    fn(&ServiceRegistry, &MediatorConfig) -> Result<Arc<dyn ErasedRequestWrapper>>;

/// Resolve and compose the full chain for `R`.
///
/// Outermost first: exception stages (placed per the configured strategy),
/// pre-processors, post-processors, user behaviors in registration order,
/// then the handler.
pub(crate) fn build_request_wrapper<R: Request>(
    registry: &ServiceRegistry,
    config: &MediatorConfig,
) -> Result<Arc<dyn ErasedRequestWrapper>> {
    let message_type = MessageType::of::<R>();
    let handler = single_handler::<dyn RequestHandler<R>>(registry, message_type)?;
    let handler_name = handler.name();

    let mut stages = exception_stages(
        registry.resolve_all::<ExceptionHandlerBinding<R>>(),
        registry.resolve_all::<ExceptionActionBinding<R>>(),
        config.exception_action_strategy,
    );

    let pre_processors = instances(registry.resolve_all::<Binding<dyn RequestPreProcessor<R>>>());
    if !pre_processors.is_empty() {
        stages.push(Arc::new(PreProcessorBehavior::new(pre_processors)));
    }
    let post_processors =
        instances(registry.resolve_all::<Binding<dyn RequestPostProcessor<R>>>());
    if !post_processors.is_empty() {
        stages.push(Arc::new(PostProcessorBehavior::new(post_processors)));
    }

    let behaviors: Vec<Arc<dyn PipelineBehavior<R>>> =
        instances(registry.resolve_all::<Binding<dyn PipelineBehavior<R>>>());
    let behavior_count = behaviors.len();
    stages.extend(behaviors);

    debug!(
        message_type = %message_type,
        handler = handler_name,
        stages = stages.len(),
        behaviors = behavior_count,
        "built request wrapper"
    );

    Ok(Arc::new(RequestWrapper {
        chain: compose(handler, &stages),
    }))
}

// =============================================================================
// Stream Wrappers
// =============================================================================

/// Type-erased view of a [`StreamWrapper`].
pub(crate) trait ErasedStreamWrapper: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn open_any(
        self: Arc<Self>,
        request: AnyMessage,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<AnyItem>>;
}

/// Dispatch entry point for stream request type `R`.
pub(crate) struct StreamWrapper<R: StreamRequest> {
    chain: Arc<dyn StreamStage<R>>,
}

impl<R: StreamRequest> StreamWrapper<R> {
    /// Open the composed stream. The returned stream owns the request.
    ///
    /// Cancelling `cancel` ends the stream with one `Cancelled` error after
    /// dropping the inner stages.
    pub(crate) fn open(
        self: Arc<Self>,
        request: R,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<R::Item>> {
        Box::pin(stream! {
            trace!(request_type = std::any::type_name::<R>(), "opening stream");
            let mut inner = self.chain.open(&request, cancel.clone());
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = inner.next() => Some(item),
                };
                match next {
                    Some(Some(item)) => yield item,
                    Some(None) => break,
                    None => {
                        drop(inner);
                        debug!(request_type = std::any::type_name::<R>(), "stream cancelled");
                        yield Err(MediatorError::Cancelled.into());
                        break;
                    }
                }
            }
        })
    }
}

impl<R: StreamRequest> ErasedStreamWrapper for StreamWrapper<R> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn open_any(
        self: Arc<Self>,
        request: AnyMessage,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<AnyItem>> {
        match request.downcast::<R>() {
            Ok(request) => self
                .open(*request, cancel)
                .map(|item| item.map(|value| Box::new(value) as AnyItem))
                .boxed(),
            Err(_) => failed_stream(
                MediatorError::MessageTypeMismatch {
                    expected: std::any::type_name::<R>(),
                }
                .into(),
            ),
        }
    }
}

/// Builds the wrapper for a stream request type.
pub(crate) type BuildStreamWrapper =
    fn(&ServiceRegistry, &MediatorConfig) -> Result<Arc<dyn ErasedStreamWrapper>>;

pub(crate) fn build_stream_wrapper<R: StreamRequest>(
    registry: &ServiceRegistry,
    _config: &MediatorConfig,
) -> Result<Arc<dyn ErasedStreamWrapper>> {
    let message_type = MessageType::of::<R>();
    let handler = single_handler::<dyn StreamRequestHandler<R>>(registry, message_type)?;
    let behaviors: Vec<Arc<dyn StreamPipelineBehavior<R>>> =
        instances(registry.resolve_all::<Binding<dyn StreamPipelineBehavior<R>>>());

    debug!(
        message_type = %message_type,
        handler = handler.name(),
        behaviors = behaviors.len(),
        "built stream wrapper"
    );

    Ok(Arc::new(StreamWrapper {
        chain: compose_stream(handler, &behaviors),
    }))
}

/// A stream whose only item is `error`.
pub(crate) fn failed_stream<T: Send + 'static>(
    error: anyhow::Error,
) -> BoxStream<'static, Result<T>> {
    futures::stream::once(async move { Err(error) }).boxed()
}

// =============================================================================
// Notification Wrappers
// =============================================================================

/// Every handler bound to one notification type. May be empty.
#[derive(Debug)]
pub(crate) struct NotificationWrapper {
    executors: Vec<NotificationHandlerExecutor>,
}

impl NotificationWrapper {
    pub(crate) fn executors(&self) -> &[NotificationHandlerExecutor] {
        &self.executors
    }
}

/// Builds the wrapper for a notification type.
pub(crate) type BuildNotificationWrapper =
    fn(&ServiceRegistry, &MediatorConfig) -> Result<Arc<NotificationWrapper>>;

pub(crate) fn build_notification_wrapper<N: Notification>(
    registry: &ServiceRegistry,
    _config: &MediatorConfig,
) -> Result<Arc<NotificationWrapper>> {
    let executors: Vec<_> = registry
        .resolve_all::<Binding<dyn NotificationHandler<N>>>()
        .into_iter()
        .map(NotificationHandlerExecutor::new)
        .collect();

    debug!(
        message_type = %MessageType::of::<N>(),
        handlers = executors.len(),
        "built notification wrapper"
    );

    Ok(Arc::new(NotificationWrapper { executors }))
}

// =============================================================================
// Helpers
// =============================================================================

fn single_handler<S>(registry: &ServiceRegistry, message_type: MessageType) -> Result<Binding<S>>
where
    S: ?Sized + Send + Sync + 'static,
{
    let mut handlers = registry.resolve_all::<Binding<S>>();
    match handlers.len() {
        0 => Err(MediatorError::HandlerNotFound { message_type }.into()),
        1 => Ok(handlers.remove(0)),
        count => Err(MediatorError::AmbiguousHandler {
            message_type,
            count,
        }
        .into()),
    }
}

fn instances<S: ?Sized>(bindings: Vec<Binding<S>>) -> Vec<Arc<S>> {
    bindings
        .into_iter()
        .map(|binding| binding.instance().clone())
        .collect()
}
