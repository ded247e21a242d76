//! Behavior pipeline for streaming requests.
//!
//! Same composition rule as [`crate::pipeline`], but every stage produces a
//! lazy sequence instead of one value. A wrapping behavior may yield items
//! of its own before delegating, forward the inner items in order, and
//! yield more after the inner sequence ends.
//!
//! Nothing runs until the stream is polled. Dropping the stream early drops
//! every stage's state with it, so consuming fewer items than produced is
//! never an error and releases what the handler acquired.
//!
//! # Example
//!
//! ```ignore
//! use async_stream::stream;
//! use futures::StreamExt;
//!
//! struct Framing;
//!
//! impl StreamPipelineBehavior<Ping> for Framing {
//!     fn handle<'a>(
//!         &'a self,
//!         _request: &'a Ping,
//!         next: StreamNext<'a, Ping>,
//!         _cancel: CancellationToken,
//!     ) -> BoxStream<'a, Result<Pong>> {
//!         Box::pin(stream! {
//!             yield Ok(Pong::new("start"));
//!             let mut inner = next.run();
//!             while let Some(item) = inner.next().await {
//!                 yield item;
//!             }
//!             yield Ok(Pong::new("end"));
//!         })
//!     }
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::core::StreamRequest;
use crate::handler::StreamRequestHandler;
use crate::registry::Binding;

/// Continuation handed to a stream behavior: "open the rest of the chain".
pub struct StreamNext<'a, R: StreamRequest> {
    request: &'a R,
    stage: &'a dyn StreamStage<R>,
    cancel: CancellationToken,
}

impl<'a, R: StreamRequest> StreamNext<'a, R> {
    /// Open the inner sequence.
    pub fn run(self) -> BoxStream<'a, Result<R::Item>> {
        self.stage.open(self.request, self.cancel)
    }

    /// Open the inner sequence with a different cancellation token.
    pub fn run_with_token(self, cancel: CancellationToken) -> BoxStream<'a, Result<R::Item>> {
        self.stage.open(self.request, cancel)
    }
}

impl<R: StreamRequest> std::fmt::Debug for StreamNext<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamNext").finish_non_exhaustive()
    }
}

/// Cross-cutting interceptor around a stream handler.
pub trait StreamPipelineBehavior<R: StreamRequest>: Send + Sync + 'static {
    /// Produce the sequence for this stage, usually by wrapping
    /// `next.run()`.
    fn handle<'a>(
        &'a self,
        request: &'a R,
        next: StreamNext<'a, R>,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<R::Item>>;
}

/// One link of a composed stream chain.
pub(crate) trait StreamStage<R: StreamRequest>: Send + Sync {
    fn open<'a>(&'a self, request: &'a R, cancel: CancellationToken)
        -> BoxStream<'a, Result<R::Item>>;
}

struct HandlerStreamStage<R: StreamRequest> {
    handler: Binding<dyn StreamRequestHandler<R>>,
}

impl<R: StreamRequest> StreamStage<R> for HandlerStreamStage<R> {
    fn open<'a>(
        &'a self,
        request: &'a R,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<R::Item>> {
        self.handler.instance().handle(request, cancel)
    }
}

struct BehaviorStreamStage<R: StreamRequest> {
    behavior: Arc<dyn StreamPipelineBehavior<R>>,
    next: Arc<dyn StreamStage<R>>,
}

impl<R: StreamRequest> StreamStage<R> for BehaviorStreamStage<R> {
    fn open<'a>(
        &'a self,
        request: &'a R,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<R::Item>> {
        let next = StreamNext {
            request,
            stage: self.next.as_ref(),
            cancel: cancel.clone(),
        };
        self.behavior.handle(request, next, cancel)
    }
}

/// Compose stream behaviors around a stream handler, first registered
/// outermost.
pub(crate) fn compose_stream<R: StreamRequest>(
    handler: Binding<dyn StreamRequestHandler<R>>,
    behaviors: &[Arc<dyn StreamPipelineBehavior<R>>],
) -> Arc<dyn StreamStage<R>> {
    let innermost: Arc<dyn StreamStage<R>> = Arc::new(HandlerStreamStage { handler });
    behaviors.iter().rev().fold(innermost, |next, behavior| -> Arc<dyn StreamStage<R>> {
        Arc::new(BehaviorStreamStage {
            behavior: behavior.clone(),
            next,
        })
    })
}
