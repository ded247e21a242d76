//! Service registry: the registration and service-location boundary.
//!
//! The mediator never constructs handlers, behaviors or exception bindings
//! itself. It asks the registry for "every instance implementing capability
//! `S`" and gets them back in registration order.
//!
//! Services are keyed by the `TypeId` of their stored type, so
//! `Binding<dyn RequestHandler<Ping>>` and `Binding<dyn RequestHandler<Zing>>`
//! live under different keys.
//!
//! # Dispatch Hooks
//!
//! The dynamic path (`send_any` and friends) only knows a message's
//! `TypeId`. Generic code cannot be recovered from a `TypeId`, so the typed
//! registration helpers also record, per message type, a monomorphised
//! function that builds the wrapper for that type. Every handler reaches
//! the registry through those helpers, so a type with a handler always has
//! a hook and the dynamic path never depends on what the typed path has
//! already cached.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = ServiceRegistry::new();
//! registry.add_request_handler::<Ping, _>(PingHandler);
//! registry.add_behavior::<Ping, _>(OuterBehavior::new(log.clone()));
//! registry.add_behavior::<Ping, _>(InnerBehavior::new(log.clone()));
//!
//! let mediator = Mediator::new(registry);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Notification, Request, StreamRequest};
use crate::exception::{
    ErrorClass, ExceptionActionBinding, ExceptionHandlerBinding, RequestExceptionAction,
    RequestExceptionHandler,
};
use crate::handler::{NotificationHandler, RequestHandler, StreamRequestHandler};
use crate::pipeline::{PipelineBehavior, RequestPostProcessor, RequestPreProcessor};
use crate::stream::StreamPipelineBehavior;
use crate::wrapper::{
    build_notification_wrapper, build_request_wrapper, build_stream_wrapper,
    BuildNotificationWrapper, BuildRequestWrapper, BuildStreamWrapper,
};

/// A registered instance of capability `S` plus the name it was registered
/// under.
pub struct Binding<S: ?Sized> {
    name: &'static str,
    instance: Arc<S>,
}

impl<S: ?Sized> Binding<S> {
    /// Bind an instance under a display name (usually its type name).
    pub fn new(name: &'static str, instance: Arc<S>) -> Self {
        Self { name, instance }
    }

    /// The name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The bound instance.
    pub fn instance(&self) -> &Arc<S> {
        &self.instance
    }

    /// Identity of the bound instance.
    ///
    /// Two bindings sharing one `Arc` have the same identity, whatever
    /// capability or key they were registered under.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.instance) as *const () as usize
    }
}

impl<S: ?Sized> Clone for Binding<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            instance: self.instance.clone(),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for Binding<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("name", &self.name).finish()
    }
}

/// Registry of bindings, behaviors and exception bindings.
///
/// Filled once during setup and treated as immutable once handed to a
/// [`Mediator`](crate::Mediator).
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>,
    request_hooks: HashMap<TypeId, BuildRequestWrapper>,
    stream_hooks: HashMap<TypeId, BuildStreamWrapper>,
    notification_hooks: HashMap<TypeId, BuildNotificationWrapper>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // Values of the same type accumulate in registration order. Crate-only:
    // handler bindings must go through a helper that also records a hook.
    pub(crate) fn add<T>(&mut self, service: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.services
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Box::new(service));
    }

    /// Resolve every service value of type `T`, in registration order.
    pub fn resolve_all<T>(&self) -> Vec<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.services
            .get(&TypeId::of::<T>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.downcast_ref::<T>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of service values registered under type `T`.
    pub fn count<T: 'static>(&self) -> usize {
        self.services
            .get(&TypeId::of::<T>())
            .map_or(0, |entries| entries.len())
    }

    /// Register the handler for request type `R`.
    ///
    /// Registering a second handler for the same `R` is accepted here and
    /// reported as `AmbiguousHandler` when `R` is first dispatched.
    pub fn add_request_handler<R, H>(&mut self, handler: H)
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let instance: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        self.add(Binding::new(std::any::type_name::<H>(), instance));
        self.request_hooks
            .insert(TypeId::of::<R>(), build_request_wrapper::<R>);
    }

    /// Register the handler for stream request type `R`.
    pub fn add_stream_handler<R, H>(&mut self, handler: H)
    where
        R: StreamRequest,
        H: StreamRequestHandler<R>,
    {
        let instance: Arc<dyn StreamRequestHandler<R>> = Arc::new(handler);
        self.add(Binding::new(std::any::type_name::<H>(), instance));
        self.stream_hooks
            .insert(TypeId::of::<R>(), build_stream_wrapper::<R>);
    }

    /// Add a subscriber for notification type `N`.
    pub fn add_notification_handler<N, H>(&mut self, handler: H)
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let instance: Arc<dyn NotificationHandler<N>> = Arc::new(handler);
        self.add(Binding::new(std::any::type_name::<H>(), instance));
        self.notification_hooks
            .insert(TypeId::of::<N>(), build_notification_wrapper::<N>);
    }

    /// Add a pipeline behavior for request type `R`.
    ///
    /// Behaviors apply in registration order, first registered outermost.
    pub fn add_behavior<R, B>(&mut self, behavior: B)
    where
        R: Request,
        B: PipelineBehavior<R>,
    {
        let instance: Arc<dyn PipelineBehavior<R>> = Arc::new(behavior);
        self.add(Binding::new(std::any::type_name::<B>(), instance));
    }

    /// Add a stream pipeline behavior for stream request type `R`.
    pub fn add_stream_behavior<R, B>(&mut self, behavior: B)
    where
        R: StreamRequest,
        B: StreamPipelineBehavior<R>,
    {
        let instance: Arc<dyn StreamPipelineBehavior<R>> = Arc::new(behavior);
        self.add(Binding::new(std::any::type_name::<B>(), instance));
    }

    /// Add a pre-processor for request type `R`.
    pub fn add_pre_processor<R, P>(&mut self, processor: P)
    where
        R: Request,
        P: RequestPreProcessor<R>,
    {
        let instance: Arc<dyn RequestPreProcessor<R>> = Arc::new(processor);
        self.add(Binding::new(std::any::type_name::<P>(), instance));
    }

    /// Add a post-processor for request type `R`.
    pub fn add_post_processor<R, P>(&mut self, processor: P)
    where
        R: Request,
        P: RequestPostProcessor<R>,
    {
        let instance: Arc<dyn RequestPostProcessor<R>> = Arc::new(processor);
        self.add(Binding::new(std::any::type_name::<P>(), instance));
    }

    /// Bind an exception handler for errors of class `E` raised while
    /// handling `R`.
    pub fn add_exception_handler<R, E, H>(&mut self, handler: H)
    where
        R: Request,
        E: ErrorClass,
        H: RequestExceptionHandler<R>,
    {
        let instance: Arc<dyn RequestExceptionHandler<R>> = Arc::new(handler);
        self.add(ExceptionHandlerBinding::<R>::new::<E>(Binding::new(
            std::any::type_name::<H>(),
            instance,
        )));
    }

    /// Bind an already shared exception handler instance for class `E`.
    ///
    /// Binding one instance under several classes is allowed; it still runs
    /// at most once per dispatch.
    pub fn add_shared_exception_handler<R, E>(
        &mut self,
        handler: Arc<dyn RequestExceptionHandler<R>>,
    ) where
        R: Request,
        E: ErrorClass,
    {
        let name = std::any::type_name_of_val(handler.as_ref());
        self.add(ExceptionHandlerBinding::<R>::new::<E>(Binding::new(
            name, handler,
        )));
    }

    /// Bind an exception action for errors of class `E` raised while
    /// handling `R`.
    pub fn add_exception_action<R, E, A>(&mut self, action: A)
    where
        R: Request,
        E: ErrorClass,
        A: RequestExceptionAction<R>,
    {
        let instance: Arc<dyn RequestExceptionAction<R>> = Arc::new(action);
        self.add(ExceptionActionBinding::<R>::new::<E>(Binding::new(
            std::any::type_name::<A>(),
            instance,
        )));
    }

    /// Bind an already shared exception action instance for class `E`.
    pub fn add_shared_exception_action<R, E>(&mut self, action: Arc<dyn RequestExceptionAction<R>>)
    where
        R: Request,
        E: ErrorClass,
    {
        let name = std::any::type_name_of_val(action.as_ref());
        self.add(ExceptionActionBinding::<R>::new::<E>(Binding::new(
            name, action,
        )));
    }

    pub(crate) fn request_hook(&self, type_id: TypeId) -> Option<BuildRequestWrapper> {
        self.request_hooks.get(&type_id).copied()
    }

    pub(crate) fn stream_hook(&self, type_id: TypeId) -> Option<BuildStreamWrapper> {
        self.stream_hooks.get(&type_id).copied()
    }

    pub(crate) fn notification_hook(&self, type_id: TypeId) -> Option<BuildNotificationWrapper> {
        self.notification_hooks.get(&type_id).copied()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("service_types", &self.services.len())
            .field("request_types", &self.request_hooks.len())
            .field("stream_types", &self.stream_hooks.len())
            .field("notification_types", &self.notification_hooks.len())
            .finish()
    }
}
