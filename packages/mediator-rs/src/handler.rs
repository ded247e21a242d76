//! Handler traits for requests, streams and notifications.
//!
//! Handlers are the application code the mediator routes messages to.
//! They are registered once during setup and shared across every dispatch,
//! so they take `&self` and must be `Send + Sync`.
//!
//! # Key Properties
//!
//! - **One request type = one handler**: zero or several is a dispatch error
//! - **One notification type = any number of handlers**: zero is fine
//! - **Cooperative cancellation**: every handler receives the caller's token

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::core::{Notification, Request, StreamRequest};

/// Handler producing the single response of a request type.
///
/// # Example
///
/// ```ignore
/// struct PingHandler;
///
/// #[async_trait]
/// impl RequestHandler<Ping> for PingHandler {
///     async fn handle(&self, request: &Ping, _cancel: &CancellationToken) -> Result<Pong> {
///         Ok(Pong { message: format!("{} Pong", request.message) })
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    /// Handle the request and produce its response.
    ///
    /// # Errors
    ///
    /// Return `Err` if handling fails. The error passes through the
    /// exception routing stages of the pipeline before reaching the caller.
    async fn handle(&self, request: &R, cancel: &CancellationToken) -> Result<R::Response>;
}

/// Handler producing a lazy sequence of items for a stream request.
///
/// The returned stream borrows the handler and the request. Items are
/// produced on demand; dropping the stream early releases whatever the
/// handler holds.
///
/// # Example
///
/// ```ignore
/// impl StreamRequestHandler<Ticks> for TickHandler {
///     fn handle<'a>(
///         &'a self,
///         request: &'a Ticks,
///         cancel: CancellationToken,
///     ) -> BoxStream<'a, Result<u64>> {
///         Box::pin(async_stream::stream! {
///             for n in 0..request.count {
///                 if cancel.is_cancelled() {
///                     break;
///                 }
///                 yield Ok(n);
///             }
///         })
///     }
/// }
/// ```
pub trait StreamRequestHandler<R: StreamRequest>: Send + Sync + 'static {
    /// Open the item sequence for this request.
    fn handle<'a>(&'a self, request: &'a R, cancel: CancellationToken)
        -> BoxStream<'a, Result<R::Item>>;
}

/// Subscriber to a notification type.
#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    /// React to the notification.
    ///
    /// # Errors
    ///
    /// Returning `Err` is reported to the publish strategy, which decides
    /// whether remaining handlers still run.
    async fn handle(&self, notification: &N, cancel: &CancellationToken) -> Result<()>;
}
