//! Exception routing for request pipelines.
//!
//! When a request's handler (or a behavior inside the router) fails, the
//! error is matched against bindings declared for **error classes**:
//!
//! - **Actions** observe the error and never change the outcome. Every
//!   matching action runs once, then the original error is returned.
//! - **Handlers** may resolve the error by calling
//!   [`ExceptionState::set_handled`] with a substitute response. They are
//!   tried from the most specific matching class to the least specific; the
//!   first one that resolves wins and later ones never run.
//!
//! # Error Classes
//!
//! Rust errors have no inheritance, so the hierarchy is declared with
//! [`ErrorClass`]. The root class is `anyhow::Error` itself: a binding for
//! it matches every error.
//!
//! ```ignore
//! #[derive(Debug, thiserror::Error)]
//! #[error("{0} Thrown")]
//! struct PingError(String);
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("{0} Thrown")]
//! struct PongError(String);
//!
//! // Abstract ancestor defined by its members
//! enum PingPongFamily {}
//! error_class!(family PingPongFamily => anyhow::Error; PingError, PongError);
//!
//! error_class!(PingError => PingPongFamily);
//! error_class!(PongError => PingPongFamily);
//! ```
//!
//! A `PingError` then matches bindings for `PingError` (depth 2),
//! `PingPongFamily` (depth 1) and `anyhow::Error` (depth 0), in that order
//! of preference. A `PongError` binding never sees it.

use std::any::TypeId;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::Request;
use crate::error::{extract_panic_message, MediatorError};
use crate::pipeline::{Next, PipelineBehavior};
use crate::registry::Binding;

/// A declared error type exception bindings can target.
pub trait ErrorClass: 'static {
    /// The next more general class. The root class is its own parent.
    type Parent: ErrorClass;

    /// Whether `error` belongs to this class or one of its descendants.
    fn is_instance(error: &anyhow::Error) -> bool;

    /// Distance from the root class. Larger means more specific.
    fn depth() -> usize {
        if TypeId::of::<Self>() == TypeId::of::<Self::Parent>() {
            0
        } else {
            Self::Parent::depth() + 1
        }
    }
}

/// The root class: every error is an `anyhow::Error`.
impl ErrorClass for anyhow::Error {
    type Parent = anyhow::Error;

    fn is_instance(_error: &anyhow::Error) -> bool {
        true
    }
}

/// Declare an [`ErrorClass`].
///
/// - `error_class!(MyError)`: concrete class directly under the root.
/// - `error_class!(MyError => Parent)`: concrete class under `Parent`.
/// - `error_class!(MyError => Parent; ChildA, ChildB)`: concrete class whose
///   own subclasses also count as instances.
/// - `error_class!(family Family => Parent; MemberA, MemberB)`: abstract
///   class with no values of its own, matched through its members.
///
/// Concrete classes match by `anyhow::Error::downcast_ref`, which also sees
/// through `.context(..)` layers.
#[macro_export]
macro_rules! error_class {
    (family $ty:ty => $parent:ty; $($member:ty),+ $(,)?) => {
        impl $crate::ErrorClass for $ty {
            type Parent = $parent;

            fn is_instance(error: &$crate::anyhow::Error) -> bool {
                false $(|| <$member as $crate::ErrorClass>::is_instance(error))+
            }
        }
    };
    ($ty:ty => $parent:ty; $($child:ty),+ $(,)?) => {
        impl $crate::ErrorClass for $ty {
            type Parent = $parent;

            fn is_instance(error: &$crate::anyhow::Error) -> bool {
                error.downcast_ref::<$ty>().is_some()
                    $(|| <$child as $crate::ErrorClass>::is_instance(error))+
            }
        }
    };
    ($ty:ty => $parent:ty) => {
        impl $crate::ErrorClass for $ty {
            type Parent = $parent;

            fn is_instance(error: &$crate::anyhow::Error) -> bool {
                error.downcast_ref::<$ty>().is_some()
            }
        }
    };
    ($ty:ty) => {
        $crate::error_class!($ty => $crate::anyhow::Error);
    };
}

/// Monomorphised view of an [`ErrorClass`], stored with each binding.
#[derive(Clone, Copy)]
pub struct ErrorClassInfo {
    name: &'static str,
    depth: usize,
    matches: fn(&anyhow::Error) -> bool,
}

impl ErrorClassInfo {
    /// Capture class `E`.
    pub fn of<E: ErrorClass>() -> Self {
        Self {
            name: std::any::type_name::<E>(),
            depth: E::depth(),
            matches: E::is_instance,
        }
    }

    /// The class's type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Distance from the root class.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether `error` is an instance of this class.
    pub fn matches(&self, error: &anyhow::Error) -> bool {
        (self.matches)(error)
    }
}

impl std::fmt::Debug for ErrorClassInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassInfo")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Per-dispatch state shared by the exception handlers tried for one error.
///
/// Created fresh for every failed dispatch and never shared.
#[derive(Debug)]
pub struct ExceptionState<T> {
    handled: bool,
    response: Option<T>,
}

impl<T> ExceptionState<T> {
    pub(crate) fn new() -> Self {
        Self {
            handled: false,
            response: None,
        }
    }

    /// Mark the error resolved and supply the response the caller receives
    /// instead of the error.
    pub fn set_handled(&mut self, response: T) {
        self.handled = true;
        self.response = Some(response);
    }

    /// Whether a handler resolved the error.
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// The substitute response, if one was supplied.
    pub fn response(&self) -> Option<&T> {
        self.response.as_ref()
    }

    fn take_response(&mut self) -> Option<T> {
        if self.handled {
            self.response.take()
        } else {
            None
        }
    }
}

/// May resolve an error raised while handling `R`.
///
/// # Example
///
/// ```ignore
/// struct FallbackPong;
///
/// #[async_trait]
/// impl RequestExceptionHandler<Ping> for FallbackPong {
///     async fn handle(
///         &self,
///         _request: &Ping,
///         error: &anyhow::Error,
///         state: &mut ExceptionState<Pong>,
///         _cancel: &CancellationToken,
///     ) -> Result<()> {
///         state.set_handled(Pong { message: format!("{error} Handled") });
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RequestExceptionHandler<R: Request>: Send + Sync + 'static {
    /// Inspect the error and optionally resolve it through `state`.
    ///
    /// # Errors
    ///
    /// Returning `Err` replaces the original error and stops routing.
    async fn handle(
        &self,
        request: &R,
        error: &anyhow::Error,
        state: &mut ExceptionState<R::Response>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Observes an error raised while handling `R`.
#[async_trait]
pub trait RequestExceptionAction<R: Request>: Send + Sync + 'static {
    /// React to the error. Cannot change the dispatch outcome.
    ///
    /// # Errors
    ///
    /// Returning `Err` surfaces that error instead of the original one;
    /// secondary failures are never dropped.
    async fn execute(
        &self,
        request: &R,
        error: &anyhow::Error,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// An exception handler bound to an error class.
pub struct ExceptionHandlerBinding<R: Request> {
    class: ErrorClassInfo,
    handler: Binding<dyn RequestExceptionHandler<R>>,
}

impl<R: Request> ExceptionHandlerBinding<R> {
    /// Bind `handler` to class `E`.
    pub fn new<E: ErrorClass>(handler: Binding<dyn RequestExceptionHandler<R>>) -> Self {
        Self {
            class: ErrorClassInfo::of::<E>(),
            handler,
        }
    }

    /// The declared error class.
    pub fn class(&self) -> &ErrorClassInfo {
        &self.class
    }
}

impl<R: Request> Clone for ExceptionHandlerBinding<R> {
    fn clone(&self) -> Self {
        Self {
            class: self.class,
            handler: self.handler.clone(),
        }
    }
}

/// An exception action bound to an error class.
pub struct ExceptionActionBinding<R: Request> {
    class: ErrorClassInfo,
    action: Binding<dyn RequestExceptionAction<R>>,
}

impl<R: Request> ExceptionActionBinding<R> {
    /// Bind `action` to class `E`.
    pub fn new<E: ErrorClass>(action: Binding<dyn RequestExceptionAction<R>>) -> Self {
        Self {
            class: ErrorClassInfo::of::<E>(),
            action,
        }
    }

    /// The declared error class.
    pub fn class(&self) -> &ErrorClassInfo {
        &self.class
    }
}

impl<R: Request> Clone for ExceptionActionBinding<R> {
    fn clone(&self) -> Self {
        Self {
            class: self.class,
            action: self.action.clone(),
        }
    }
}

/// Where exception actions sit relative to exception handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionActionStrategy {
    /// Actions wrap the handlers and only see errors no handler resolved.
    #[default]
    ApplyForUnhandledExceptions,
    /// Actions sit inside the handlers and see every error.
    ApplyForAllExceptions,
}

/// Tries exception handlers, most specific class first.
pub(crate) struct ExceptionHandlerBehavior<R: Request> {
    // Sorted by descending class depth, registration order within a depth
    bindings: Vec<ExceptionHandlerBinding<R>>,
}

impl<R: Request> ExceptionHandlerBehavior<R> {
    pub(crate) fn new(mut bindings: Vec<ExceptionHandlerBinding<R>>) -> Self {
        bindings.sort_by(|a, b| b.class.depth.cmp(&a.class.depth));
        Self { bindings }
    }

    async fn route(
        &self,
        request: &R,
        error: anyhow::Error,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let mut state = ExceptionState::new();
        let mut seen = HashSet::new();

        let candidates = self
            .bindings
            .iter()
            .filter(|binding| binding.class.matches(&error));

        for binding in candidates {
            if !seen.insert(binding.handler.identity()) {
                continue;
            }

            let outcome = AssertUnwindSafe(binding.handler.instance().handle(
                request,
                &error,
                &mut state,
                cancel,
            ))
            .catch_unwind()
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(secondary)) => {
                    warn!(
                        handler = binding.handler.name(),
                        original = %error,
                        error = %secondary,
                        "exception handler failed, surfacing its error"
                    );
                    return Err(secondary);
                }
                Err(panic_info) => {
                    let message = extract_panic_message(&panic_info);
                    error!(
                        handler = binding.handler.name(),
                        original = %error,
                        panic = %message,
                        "exception handler panicked"
                    );
                    return Err(MediatorError::ExceptionHandlerPanicked {
                        handler: binding.handler.name(),
                        message,
                    }
                    .into());
                }
            }

            if let Some(response) = state.take_response() {
                debug!(
                    handler = binding.handler.name(),
                    class = binding.class.name,
                    error = %error,
                    "exception handled"
                );
                return Ok(response);
            }
        }

        Err(error)
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for ExceptionHandlerBehavior<R> {
    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        match next.run().await {
            Ok(response) => Ok(response),
            Err(error) => self.route(request, error, cancel).await,
        }
    }
}

/// Runs every matching exception action once, then returns the original
/// error.
pub(crate) struct ExceptionActionBehavior<R: Request> {
    bindings: Vec<ExceptionActionBinding<R>>,
}

impl<R: Request> ExceptionActionBehavior<R> {
    pub(crate) fn new(bindings: Vec<ExceptionActionBinding<R>>) -> Self {
        Self { bindings }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for ExceptionActionBehavior<R> {
    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let error = match next.run().await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        let mut seen = HashSet::new();
        let candidates = self
            .bindings
            .iter()
            .filter(|binding| binding.class.matches(&error));

        for binding in candidates {
            if !seen.insert(binding.action.identity()) {
                continue;
            }
            let outcome =
                AssertUnwindSafe(binding.action.instance().execute(request, &error, cancel))
                    .catch_unwind()
                    .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(secondary)) => {
                    warn!(
                        action = binding.action.name(),
                        original = %error,
                        error = %secondary,
                        "exception action failed, surfacing its error"
                    );
                    return Err(secondary);
                }
                Err(panic_info) => {
                    let message = extract_panic_message(&panic_info);
                    error!(
                        action = binding.action.name(),
                        original = %error,
                        panic = %message,
                        "exception action panicked"
                    );
                    return Err(MediatorError::ExceptionActionPanicked {
                        action: binding.action.name(),
                        message,
                    }
                    .into());
                }
            }
        }

        Err(error)
    }
}

/// Build the exception stages for `R`, outermost first, per `strategy`.
///
/// Only stages with at least one binding are returned.
pub(crate) fn exception_stages<R: Request>(
    handlers: Vec<ExceptionHandlerBinding<R>>,
    actions: Vec<ExceptionActionBinding<R>>,
    strategy: ExceptionActionStrategy,
) -> Vec<Arc<dyn PipelineBehavior<R>>> {
    let handler_stage: Option<Arc<dyn PipelineBehavior<R>>> = if handlers.is_empty() {
        None
    } else {
        Some(Arc::new(ExceptionHandlerBehavior::new(handlers)))
    };
    let action_stage: Option<Arc<dyn PipelineBehavior<R>>> = if actions.is_empty() {
        None
    } else {
        Some(Arc::new(ExceptionActionBehavior::new(actions)))
    };

    let ordered = match strategy {
        ExceptionActionStrategy::ApplyForUnhandledExceptions => [action_stage, handler_stage],
        ExceptionActionStrategy::ApplyForAllExceptions => [handler_stage, action_stage],
    };
    ordered.into_iter().flatten().collect()
}
