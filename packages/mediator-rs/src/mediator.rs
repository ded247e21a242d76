//! The mediator facade: `send`, `publish` and `create_stream`.
//!
//! # Calling Conventions
//!
//! Every operation comes in two forms:
//!
//! - **Typed**: `send::<R>(request)` knows `R` at compile time and returns
//!   `R::Response` directly.
//! - **Dynamic**: `send_any(Some(boxed))` takes a message whose static type
//!   is unknown and routes it by its concrete runtime type. The response is
//!   boxed and must be downcast by the caller. Passing `None` fails with
//!   [`MediatorError::MissingMessage`] before any resolution happens.
//!
//! Both forms share the same wrapper for a given concrete type.
//!
//! # Cancellation
//!
//! Operations without `_with_token` use a fresh token that is never
//! cancelled. Tokens are cooperative: they reach every behavior, handler
//! and stream stage, which decide when to stop.
//!
//! # Example
//!
//! ```ignore
//! let mediator = MediatorBuilder::new()
//!     .with_request_handler::<Ping, _>(PingHandler)
//!     .with_behavior::<Ping, _>(TracingBehavior)
//!     .with_notification_handler::<Pinged, _>(PongHandler)
//!     .with_notification_handler::<Pinged, _>(PungHandler)
//!     .build();
//!
//! let pong = mediator.send(Ping::new("Ping")).await?;
//! mediator.publish(Pinged::new("Ping")).await?;
//!
//! let mut ticks = mediator.create_stream(Ticks { count: 3 });
//! while let Some(tick) = ticks.next().await {
//!     println!("{}", tick?);
//! }
//! ```

use std::any::{Any, TypeId};
use std::sync::Arc;

use anyhow::Result;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::MediatorConfig;
use crate::core::{
    AnyItem, AnyMessage, AnyResponse, MessageType, Notification, Request, StreamRequest,
};
use crate::error::MediatorError;
use crate::exception::{ErrorClass, RequestExceptionAction, RequestExceptionHandler};
use crate::handler::{NotificationHandler, RequestHandler, StreamRequestHandler};
use crate::pipeline::{PipelineBehavior, RequestPostProcessor, RequestPreProcessor};
use crate::publish::NotificationPublisher;
use crate::registry::ServiceRegistry;
use crate::stream::StreamPipelineBehavior;
use crate::wrapper::{
    build_notification_wrapper, build_request_wrapper, build_stream_wrapper, failed_stream,
    ErasedRequestWrapper, ErasedStreamWrapper, NotificationWrapper, RequestWrapper, StreamWrapper,
    WrapperCache,
};

/// In-process dispatcher for requests, streams and notifications.
///
/// Cheap to clone; clones share the registry and the wrapper caches.
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<MediatorInner>,
}

struct MediatorInner {
    registry: ServiceRegistry,
    config: MediatorConfig,
    publisher: Arc<dyn NotificationPublisher>,
    requests: WrapperCache<dyn ErasedRequestWrapper>,
    streams: WrapperCache<dyn ErasedStreamWrapper>,
    notifications: WrapperCache<NotificationWrapper>,
}

impl Mediator {
    /// Create a mediator over `registry` with the default configuration.
    pub fn new(registry: ServiceRegistry) -> Self {
        MediatorBuilder::new().with_registry(registry).build()
    }

    /// Start building a mediator.
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::new()
    }

    /// The active configuration.
    pub fn config(&self) -> &MediatorConfig {
        &self.inner.config
    }

    /// Number of wrappers built so far, across requests, streams and
    /// notifications.
    pub fn cached_wrapper_count(&self) -> usize {
        self.inner.requests.len() + self.inner.streams.len() + self.inner.notifications.len()
    }

    // =========================================================================
    // Send
    // =========================================================================

    /// Send a request to its single handler and return the response.
    ///
    /// # Errors
    ///
    /// - [`MediatorError::HandlerNotFound`] / [`MediatorError::AmbiguousHandler`]
    ///   when `R` does not have exactly one handler
    /// - the handler's error, unless an exception handler resolved it
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        self.send_with_token(request, CancellationToken::new()).await
    }

    /// [`send`](Self::send) with a caller-supplied cancellation token.
    pub async fn send_with_token<R: Request>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> Result<R::Response> {
        let wrapper = self.request_wrapper::<R>()?;
        wrapper.handle(&request, cancel).await
    }

    /// Send a request whose static type is unknown.
    ///
    /// Routes by the concrete type inside the box. The response is the
    /// request's `Response` boxed as [`AnyResponse`].
    ///
    /// # Errors
    ///
    /// [`MediatorError::MissingMessage`] for `None`, then the same errors as
    /// [`send`](Self::send).
    pub async fn send_any(
        &self,
        request: Option<AnyMessage>,
        cancel: CancellationToken,
    ) -> Result<AnyResponse> {
        let request = request.ok_or(MediatorError::MissingMessage)?;
        let message_type = MessageType::of_erased(&*request);

        let wrapper = self.inner.requests.get_or_build(message_type.id(), || {
            let build = self
                .inner
                .registry
                .request_hook(message_type.id())
                .ok_or(MediatorError::HandlerNotFound { message_type })?;
            build(&self.inner.registry, &self.inner.config)
        })?;

        wrapper.handle_any(request, cancel).await
    }

    fn request_wrapper<R: Request>(&self) -> Result<Arc<RequestWrapper<R>>> {
        let erased = self.inner.requests.get_or_build(TypeId::of::<R>(), || {
            build_request_wrapper::<R>(&self.inner.registry, &self.inner.config)
        })?;
        erased
            .into_any()
            .downcast::<RequestWrapper<R>>()
            .map_err(|_| {
                MediatorError::MessageTypeMismatch {
                    expected: std::any::type_name::<R>(),
                }
                .into()
            })
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Deliver a notification to every handler bound to its type, using the
    /// configured publisher.
    ///
    /// Zero bound handlers is not an error.
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<()> {
        self.publish_with_token(notification, CancellationToken::new())
            .await
    }

    /// [`publish`](Self::publish) with a caller-supplied cancellation token.
    pub async fn publish_with_token<N: Notification>(
        &self,
        notification: N,
        cancel: CancellationToken,
    ) -> Result<()> {
        let publisher = self.inner.publisher.clone();
        self.publish_with(notification, publisher.as_ref(), cancel)
            .await
    }

    /// Publish through `publisher` instead of the configured one.
    ///
    /// Runs exactly the path a configured publisher runs, so a one-off
    /// strategy behaves like a permanent one.
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        publisher: &dyn NotificationPublisher,
        cancel: CancellationToken,
    ) -> Result<()> {
        let wrapper = self.inner.notifications.get_or_build(TypeId::of::<N>(), || {
            build_notification_wrapper::<N>(&self.inner.registry, &self.inner.config)
        })?;
        publisher
            .publish(wrapper.executors(), &notification, &cancel)
            .await
    }

    /// Publish a notification whose static type is unknown.
    ///
    /// A type nothing subscribes to completes without error.
    ///
    /// # Errors
    ///
    /// [`MediatorError::MissingMessage`] for `None`, otherwise whatever the
    /// configured publisher reports.
    pub async fn publish_any(
        &self,
        notification: Option<AnyMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let notification = notification.ok_or(MediatorError::MissingMessage)?;
        let type_id = (*notification).type_id();

        // A cached wrapper wins over the hook, whichever path built it
        let wrapper = match self.inner.notifications.get(type_id) {
            Some(wrapper) => wrapper,
            None => {
                let Some(build) = self.inner.registry.notification_hook(type_id) else {
                    trace!(?type_id, "no notification handlers bound");
                    return Ok(());
                };
                self.inner
                    .notifications
                    .get_or_build(type_id, || build(&self.inner.registry, &self.inner.config))?
            }
        };
        let notification: &(dyn Any + Send + Sync) = &*notification;
        self.inner
            .publisher
            .publish(wrapper.executors(), notification, &cancel)
            .await
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Open the lazy item sequence for a stream request.
    ///
    /// Nothing runs until the stream is first polled. Resolution errors are
    /// delivered as the stream's only item.
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
    ) -> BoxStream<'static, Result<R::Item>> {
        self.create_stream_with_token(request, CancellationToken::new())
    }

    /// [`create_stream`](Self::create_stream) with a caller-supplied
    /// cancellation token.
    ///
    /// Cancelling the token ends the stream with a single
    /// [`MediatorError::Cancelled`] item.
    pub fn create_stream_with_token<R: StreamRequest>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<R::Item>> {
        match self.stream_wrapper::<R>() {
            Ok(wrapper) => wrapper.open(request, cancel),
            Err(e) => failed_stream(e),
        }
    }

    /// Open a stream for a request whose static type is unknown. Items are
    /// boxed as [`AnyItem`].
    pub fn create_stream_any(
        &self,
        request: Option<AnyMessage>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<AnyItem>> {
        let Some(request) = request else {
            return failed_stream(MediatorError::MissingMessage.into());
        };
        let message_type = MessageType::of_erased(&*request);

        let wrapper = self.inner.streams.get_or_build(message_type.id(), || {
            let build = self
                .inner
                .registry
                .stream_hook(message_type.id())
                .ok_or(MediatorError::HandlerNotFound { message_type })?;
            build(&self.inner.registry, &self.inner.config)
        });

        match wrapper {
            Ok(wrapper) => wrapper.open_any(request, cancel),
            Err(e) => failed_stream(e),
        }
    }

    fn stream_wrapper<R: StreamRequest>(&self) -> Result<Arc<StreamWrapper<R>>> {
        let erased = self.inner.streams.get_or_build(TypeId::of::<R>(), || {
            build_stream_wrapper::<R>(&self.inner.registry, &self.inner.config)
        })?;
        erased
            .into_any()
            .downcast::<StreamWrapper<R>>()
            .map_err(|_| {
                MediatorError::MessageTypeMismatch {
                    expected: std::any::type_name::<R>(),
                }
                .into()
            })
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .field("cached_wrappers", &self.cached_wrapper_count())
            .finish()
    }
}

/// Builder for [`Mediator`].
///
/// Registrations are applied in call order, which is also the order
/// behaviors wrap the handler (first registered outermost) and the order
/// notification handlers run under the sequential publisher.
#[derive(Default)]
pub struct MediatorBuilder {
    registry: ServiceRegistry,
    config: MediatorConfig,
    publisher: Option<Arc<dyn NotificationPublisher>>,
}

impl MediatorBuilder {
    /// Create a builder with an empty registry and default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry with one filled elsewhere.
    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: MediatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom notification publisher. Overrides the configured
    /// publish strategy.
    pub fn publisher<P: NotificationPublisher>(mut self, publisher: P) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }

    /// Register the handler for request type `R`.
    pub fn with_request_handler<R, H>(mut self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.registry.add_request_handler::<R, H>(handler);
        self
    }

    /// Register the handler for stream request type `R`.
    pub fn with_stream_handler<R, H>(mut self, handler: H) -> Self
    where
        R: StreamRequest,
        H: StreamRequestHandler<R>,
    {
        self.registry.add_stream_handler::<R, H>(handler);
        self
    }

    /// Add a subscriber for notification type `N`.
    pub fn with_notification_handler<N, H>(mut self, handler: H) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.registry.add_notification_handler::<N, H>(handler);
        self
    }

    /// Add a pipeline behavior for request type `R`.
    pub fn with_behavior<R, B>(mut self, behavior: B) -> Self
    where
        R: Request,
        B: PipelineBehavior<R>,
    {
        self.registry.add_behavior::<R, B>(behavior);
        self
    }

    /// Add a stream pipeline behavior for stream request type `R`.
    pub fn with_stream_behavior<R, B>(mut self, behavior: B) -> Self
    where
        R: StreamRequest,
        B: StreamPipelineBehavior<R>,
    {
        self.registry.add_stream_behavior::<R, B>(behavior);
        self
    }

    /// Add a pre-processor for request type `R`.
    pub fn with_pre_processor<R, P>(mut self, processor: P) -> Self
    where
        R: Request,
        P: RequestPreProcessor<R>,
    {
        self.registry.add_pre_processor::<R, P>(processor);
        self
    }

    /// Add a post-processor for request type `R`.
    pub fn with_post_processor<R, P>(mut self, processor: P) -> Self
    where
        R: Request,
        P: RequestPostProcessor<R>,
    {
        self.registry.add_post_processor::<R, P>(processor);
        self
    }

    /// Bind an exception handler for class `E` on request type `R`.
    pub fn with_exception_handler<R, E, H>(mut self, handler: H) -> Self
    where
        R: Request,
        E: ErrorClass,
        H: RequestExceptionHandler<R>,
    {
        self.registry.add_exception_handler::<R, E, H>(handler);
        self
    }

    /// Bind an exception action for class `E` on request type `R`.
    pub fn with_exception_action<R, E, A>(mut self, action: A) -> Self
    where
        R: Request,
        E: ErrorClass,
        A: RequestExceptionAction<R>,
    {
        self.registry.add_exception_action::<R, E, A>(action);
        self
    }

    /// Build the mediator. The registry is frozen from here on.
    pub fn build(self) -> Mediator {
        let publisher = self
            .publisher
            .unwrap_or_else(|| self.config.publish_strategy.publisher());

        Mediator {
            inner: Arc::new(MediatorInner {
                registry: self.registry,
                config: self.config,
                publisher,
                requests: WrapperCache::new(),
                streams: WrapperCache::new(),
                notifications: WrapperCache::new(),
            }),
        }
    }
}

impl std::fmt::Debug for MediatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediatorBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("custom_publisher", &self.publisher.is_some())
            .finish()
    }
}
