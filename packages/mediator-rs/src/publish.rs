//! Notification fan-out.
//!
//! A [`NotificationPublisher`] decides how one notification reaches the
//! handlers bound to its type: in which order, with how much concurrency and
//! what happens when one of them fails. The mediator hands every publisher
//! the same inputs (the bound handlers as [`NotificationHandlerExecutor`]s, the
//! notification and the caller's token), so strategies are interchangeable
//! without touching dispatch or registration.
//!
//! # Built-in Strategies
//!
//! | Publisher | Order | On failure |
//! |---|---|---|
//! | [`SequentialPublisher`] (default) | registration order, one at a time | stop, return the error |
//! | [`ConcurrentPublisher`] | all at once | wait for all, aggregate |
//! | [`ContinueOnErrorPublisher`] | registration order, one at a time | keep going, aggregate |
//!
//! Aggregated failures surface as the single error when only one handler
//! failed, otherwise as [`MediatorError::PublishFailed`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::core::Notification;
use crate::error::{extract_panic_message, MediatorError};
use crate::handler::NotificationHandler;
use crate::registry::Binding;

/// Type-erased invocation of one notification handler.
trait ErasedNotificationHandler: Send + Sync {
    fn call<'a>(
        &'a self,
        notification: &'a (dyn Any + Send + Sync),
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;
}

struct TypedNotificationHandler<N: Notification> {
    handler: Arc<dyn NotificationHandler<N>>,
}

impl<N: Notification> ErasedNotificationHandler for TypedNotificationHandler<N> {
    fn call<'a>(
        &'a self,
        notification: &'a (dyn Any + Send + Sync),
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let notification = notification.downcast_ref::<N>().ok_or(
                MediatorError::MessageTypeMismatch {
                    expected: std::any::type_name::<N>(),
                },
            )?;
            self.handler.handle(notification, &cancel).await
        })
    }
}

/// One bound notification handler, callable without knowing the
/// notification's static type.
#[derive(Clone)]
pub struct NotificationHandlerExecutor {
    handler_name: &'static str,
    handler: Arc<dyn ErasedNotificationHandler>,
}

impl NotificationHandlerExecutor {
    pub(crate) fn new<N: Notification>(binding: Binding<dyn NotificationHandler<N>>) -> Self {
        Self {
            handler_name: binding.name(),
            handler: Arc::new(TypedNotificationHandler {
                handler: binding.instance().clone(),
            }),
        }
    }

    /// Type name of the handler.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Invoke the handler.
    ///
    /// A panic inside the handler is returned as
    /// [`MediatorError::HandlerPanicked`].
    ///
    /// # Errors
    ///
    /// Whatever the handler returned, or `MessageTypeMismatch` when
    /// `notification` is not the type this handler subscribes to.
    pub async fn call(
        &self,
        notification: &(dyn Any + Send + Sync),
        cancel: CancellationToken,
    ) -> Result<()> {
        trace!(handler = self.handler_name, "invoking notification handler");
        match AssertUnwindSafe(self.handler.call(notification, cancel))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic_info) => {
                let message = extract_panic_message(&panic_info);
                error!(
                    handler = self.handler_name,
                    panic = %message,
                    "notification handler panicked"
                );
                Err(MediatorError::HandlerPanicked {
                    handler: self.handler_name,
                    message,
                }
                .into())
            }
        }
    }
}

impl std::fmt::Debug for NotificationHandlerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHandlerExecutor")
            .field("handler_name", &self.handler_name)
            .finish()
    }
}

/// Delivery policy for notifications.
///
/// Implement this to change how handlers are invoked, then pass it to
/// [`MediatorBuilder::publisher`](crate::MediatorBuilder::publisher) or to a
/// single [`Mediator::publish_with`](crate::Mediator::publish_with) call.
///
/// # Example
///
/// ```ignore
/// struct ReversePublisher;
///
/// #[async_trait]
/// impl NotificationPublisher for ReversePublisher {
///     async fn publish(
///         &self,
///         executors: &[NotificationHandlerExecutor],
///         notification: &(dyn Any + Send + Sync),
///         cancel: &CancellationToken,
///     ) -> Result<()> {
///         for executor in executors.iter().rev() {
///             executor.call(notification, cancel.clone()).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait NotificationPublisher: Send + Sync + 'static {
    /// Deliver `notification` to every executor.
    async fn publish(
        &self,
        executors: &[NotificationHandlerExecutor],
        notification: &(dyn Any + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Default policy: one handler at a time in registration order, stopping at
/// the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialPublisher;

#[async_trait]
impl NotificationPublisher for SequentialPublisher {
    async fn publish(
        &self,
        executors: &[NotificationHandlerExecutor],
        notification: &(dyn Any + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()> {
        for executor in executors {
            if cancel.is_cancelled() {
                return Err(MediatorError::Cancelled.into());
            }
            executor.call(notification, cancel.clone()).await?;
        }
        Ok(())
    }
}

/// Runs every handler concurrently and waits for all of them.
///
/// Every in-flight handler receives the caller's token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrentPublisher;

#[async_trait]
impl NotificationPublisher for ConcurrentPublisher {
    async fn publish(
        &self,
        executors: &[NotificationHandlerExecutor],
        notification: &(dyn Any + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let results = join_all(
            executors
                .iter()
                .map(|executor| executor.call(notification, cancel.clone())),
        )
        .await;

        aggregate(executors, results)
    }
}

/// Runs every handler in registration order even when some fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnErrorPublisher;

#[async_trait]
impl NotificationPublisher for ContinueOnErrorPublisher {
    async fn publish(
        &self,
        executors: &[NotificationHandlerExecutor],
        notification: &(dyn Any + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut results = Vec::with_capacity(executors.len());
        for executor in executors {
            if cancel.is_cancelled() {
                results.push(Err(MediatorError::Cancelled.into()));
                break;
            }
            results.push(executor.call(notification, cancel.clone()).await);
        }

        aggregate(executors, results)
    }
}

fn aggregate(executors: &[NotificationHandlerExecutor], results: Vec<Result<()>>) -> Result<()> {
    let mut failures = Vec::new();
    for (executor, result) in executors.iter().zip(results) {
        if let Err(e) = result {
            warn!(handler = executor.handler_name(), error = %e, "notification handler failed");
            failures.push(e);
        }
    }

    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(MediatorError::PublishFailed { failures }.into()),
    }
}
