//! Behavior pipeline for single-response requests.
//!
//! A pipeline is a nested chain of stages. The innermost stage invokes the
//! request handler; every behavior wraps the stage inside it. Composition is
//! a pure right fold over the behavior list, so the first registered
//! behavior ends up outermost:
//!
//! ```text
//! compose(handler, [A, B])
//!
//!   A before ─► B before ─► handler ─► B after ─► A after
//! ```
//!
//! A behavior that never calls [`Next::run`] short-circuits the chain: inner
//! behaviors and the handler do not run. That is legal, not an error.
//!
//! Composition happens once per request type, when its wrapper is built.
//! The composed chain is read-only and shared by every dispatch.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::Request;
use crate::error::{extract_panic_message, MediatorError};
use crate::handler::RequestHandler;
use crate::registry::Binding;

/// Continuation handed to a behavior: "run the rest of the chain".
///
/// Consumed by [`Next::run`], so the rest of the chain runs at most once
/// per behavior invocation.
pub struct Next<'a, R: Request> {
    request: &'a R,
    stage: &'a dyn Stage<R>,
    cancel: CancellationToken,
}

impl<'a, R: Request> Next<'a, R> {
    /// Run the inner behaviors and the handler.
    pub async fn run(self) -> Result<R::Response> {
        self.stage.invoke(self.request, self.cancel).await
    }

    /// Run the rest of the chain with a different cancellation token.
    ///
    /// Useful for behaviors that impose a deadline of their own, e.g. with
    /// a child token of the caller's.
    pub async fn run_with_token(self, cancel: CancellationToken) -> Result<R::Response> {
        self.stage.invoke(self.request, cancel).await
    }
}

impl<R: Request> std::fmt::Debug for Next<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Cross-cutting interceptor around a request handler.
///
/// # Example
///
/// ```ignore
/// struct Timing;
///
/// #[async_trait]
/// impl PipelineBehavior<Ping> for Timing {
///     async fn handle(
///         &self,
///         _request: &Ping,
///         next: Next<'_, Ping>,
///         _cancel: &CancellationToken,
///     ) -> Result<Pong> {
///         let started = Instant::now();
///         let response = next.run().await;
///         tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "ping handled");
///         response
///     }
/// }
/// ```
#[async_trait]
pub trait PipelineBehavior<R: Request>: Send + Sync + 'static {
    /// Run code around the rest of the chain, or short-circuit it.
    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response>;
}

/// Runs before the rest of the chain.
#[async_trait]
pub trait RequestPreProcessor<R: Request>: Send + Sync + 'static {
    /// Inspect the request. Returning `Err` stops the dispatch.
    async fn process(&self, request: &R, cancel: &CancellationToken) -> Result<()>;
}

/// Runs after the rest of the chain produced a response.
#[async_trait]
pub trait RequestPostProcessor<R: Request>: Send + Sync + 'static {
    /// Inspect the request and its response. Returning `Err` replaces the
    /// response with that error.
    async fn process(
        &self,
        request: &R,
        response: &R::Response,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// One link of a composed chain.
#[async_trait]
pub(crate) trait Stage<R: Request>: Send + Sync {
    async fn invoke(&self, request: &R, cancel: CancellationToken) -> Result<R::Response>;
}

/// Innermost stage: calls the handler, turning a panic into an error so
/// the outer stages (exception routing included) see it.
struct HandlerStage<R: Request> {
    handler: Binding<dyn RequestHandler<R>>,
}

#[async_trait]
impl<R: Request> Stage<R> for HandlerStage<R> {
    async fn invoke(&self, request: &R, cancel: CancellationToken) -> Result<R::Response> {
        let result = AssertUnwindSafe(self.handler.instance().handle(request, &cancel))
            .catch_unwind()
            .await;

        match result {
            Ok(inner) => inner,
            Err(panic_info) => {
                let message = extract_panic_message(&panic_info);
                error!(handler = self.handler.name(), panic = %message, "request handler panicked");
                Err(MediatorError::HandlerPanicked {
                    handler: self.handler.name(),
                    message,
                }
                .into())
            }
        }
    }
}

struct BehaviorStage<R: Request> {
    behavior: Arc<dyn PipelineBehavior<R>>,
    next: Arc<dyn Stage<R>>,
}

#[async_trait]
impl<R: Request> Stage<R> for BehaviorStage<R> {
    async fn invoke(&self, request: &R, cancel: CancellationToken) -> Result<R::Response> {
        let next = Next {
            request,
            stage: self.next.as_ref(),
            cancel: cancel.clone(),
        };
        self.behavior.handle(request, next, &cancel).await
    }
}

/// Compose behaviors around a handler.
///
/// The returned stage is the chain's entry point. `behaviors[0]` is the
/// outermost behavior; the handler is innermost.
pub(crate) fn compose<R: Request>(
    handler: Binding<dyn RequestHandler<R>>,
    behaviors: &[Arc<dyn PipelineBehavior<R>>],
) -> Arc<dyn Stage<R>> {
    let innermost: Arc<dyn Stage<R>> = Arc::new(HandlerStage { handler });
    behaviors.iter().rev().fold(innermost, |next, behavior| -> Arc<dyn Stage<R>> {
        Arc::new(BehaviorStage {
            behavior: behavior.clone(),
            next,
        })
    })
}

/// Runs every bound pre-processor, in registration order, before the chain.
pub(crate) struct PreProcessorBehavior<R: Request> {
    processors: Vec<Arc<dyn RequestPreProcessor<R>>>,
}

impl<R: Request> PreProcessorBehavior<R> {
    pub(crate) fn new(processors: Vec<Arc<dyn RequestPreProcessor<R>>>) -> Self {
        Self { processors }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for PreProcessorBehavior<R> {
    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        for processor in &self.processors {
            processor.process(request, cancel).await?;
        }
        next.run().await
    }
}

/// Runs every bound post-processor, in registration order, after the chain.
pub(crate) struct PostProcessorBehavior<R: Request> {
    processors: Vec<Arc<dyn RequestPostProcessor<R>>>,
}

impl<R: Request> PostProcessorBehavior<R> {
    pub(crate) fn new(processors: Vec<Arc<dyn RequestPostProcessor<R>>>) -> Self {
        Self { processors }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for PostProcessorBehavior<R> {
    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let response = next.run().await?;
        for processor in &self.processors {
            processor.process(request, &response, cancel).await?;
        }
        Ok(response)
    }
}

/// Logs every dispatch of the request types it is registered for.
///
/// Works for any request type:
///
/// ```ignore
/// registry.add_behavior::<Ping, _>(TracingBehavior);
/// registry.add_behavior::<CreateUser, _>(TracingBehavior);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBehavior;

#[async_trait]
impl<R: Request> PipelineBehavior<R> for TracingBehavior {
    async fn handle(
        &self,
        _request: &R,
        next: Next<'_, R>,
        _cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let request_type = std::any::type_name::<R>();
        let started = Instant::now();
        let result = next.run().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(request_type, elapsed_ms, "request handled"),
            Err(e) => debug!(request_type, elapsed_ms, error = %e, "request failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TraceLog;
    use anyhow::anyhow;

    struct Ping {
        message: String,
    }

    #[derive(Debug, PartialEq)]
    struct Pong {
        message: String,
    }

    impl Request for Ping {
        type Response = Pong;
    }

    struct PingHandler {
        log: TraceLog,
    }

    #[async_trait]
    impl RequestHandler<Ping> for PingHandler {
        async fn handle(&self, request: &Ping, _cancel: &CancellationToken) -> Result<Pong> {
            self.log.push("Handler");
            Ok(Pong {
                message: format!("{} Pong", request.message),
            })
        }
    }

    struct Named {
        name: &'static str,
        log: TraceLog,
    }

    #[async_trait]
    impl PipelineBehavior<Ping> for Named {
        async fn handle(
            &self,
            _request: &Ping,
            next: Next<'_, Ping>,
            _cancel: &CancellationToken,
        ) -> Result<Pong> {
            self.log.push(format!("{} before", self.name));
            let response = next.run().await;
            self.log.push(format!("{} after", self.name));
            response
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl PipelineBehavior<Ping> for ShortCircuit {
        async fn handle(
            &self,
            _request: &Ping,
            _next: Next<'_, Ping>,
            _cancel: &CancellationToken,
        ) -> Result<Pong> {
            Ok(Pong {
                message: "cached".into(),
            })
        }
    }

    struct Panicking;

    #[async_trait]
    impl RequestHandler<Ping> for Panicking {
        async fn handle(&self, _request: &Ping, _cancel: &CancellationToken) -> Result<Pong> {
            panic!("handler exploded");
        }
    }

    fn handler(log: &TraceLog) -> Binding<dyn RequestHandler<Ping>> {
        let handler: Arc<dyn RequestHandler<Ping>> = Arc::new(PingHandler { log: log.clone() });
        Binding::new("PingHandler", handler)
    }

    fn named(name: &'static str, log: &TraceLog) -> Arc<dyn PipelineBehavior<Ping>> {
        Arc::new(Named {
            name,
            log: log.clone(),
        })
    }

    fn ping() -> Ping {
        Ping {
            message: "Ping".into(),
        }
    }

    #[tokio::test]
    async fn test_no_behaviors_calls_handler_directly() {
        let log = TraceLog::new();
        let chain = compose(handler(&log), &[]);

        let pong = chain.invoke(&ping(), CancellationToken::new()).await.unwrap();

        assert_eq!(pong.message, "Ping Pong");
        assert_eq!(log.entries(), vec!["Handler"]);
    }

    #[tokio::test]
    async fn test_first_registered_behavior_is_outermost() {
        let log = TraceLog::new();
        let chain = compose(
            handler(&log),
            &[named("Outer", &log), named("Inner", &log)],
        );

        let pong = chain.invoke(&ping(), CancellationToken::new()).await.unwrap();

        assert_eq!(pong.message, "Ping Pong");
        assert_eq!(
            log.entries(),
            vec![
                "Outer before",
                "Inner before",
                "Handler",
                "Inner after",
                "Outer after"
            ]
        );
    }

    #[tokio::test]
    async fn test_composed_chain_is_reusable_with_stable_order() {
        let log = TraceLog::new();
        let chain = compose(handler(&log), &[named("A", &log), named("B", &log)]);

        chain.invoke(&ping(), CancellationToken::new()).await.unwrap();
        let first = log.take();
        chain.invoke(&ping(), CancellationToken::new()).await.unwrap();
        let second = log.take();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_stages() {
        let log = TraceLog::new();
        let chain = compose(
            handler(&log),
            &[
                named("Outer", &log),
                Arc::new(ShortCircuit),
                named("Inner", &log),
            ],
        );

        let pong = chain.invoke(&ping(), CancellationToken::new()).await.unwrap();

        assert_eq!(pong.message, "cached");
        assert_eq!(log.entries(), vec!["Outer before", "Outer after"]);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error() {
        let chain = compose(
            Binding::new("Panicking", Arc::new(Panicking) as Arc<dyn RequestHandler<Ping>>),
            &[],
        );

        let err = chain
            .invoke(&ping(), CancellationToken::new())
            .await
            .unwrap_err();

        match err.downcast_ref::<MediatorError>() {
            Some(MediatorError::HandlerPanicked { handler, message }) => {
                assert_eq!(*handler, "Panicking");
                assert_eq!(message, "handler exploded");
            }
            other => panic!("expected HandlerPanicked, got {:?}", other),
        }
    }

    struct Validate;

    #[async_trait]
    impl RequestPreProcessor<Ping> for Validate {
        async fn process(&self, request: &Ping, _cancel: &CancellationToken) -> Result<()> {
            if request.message.is_empty() {
                return Err(anyhow!("message required"));
            }
            Ok(())
        }
    }

    struct Audit {
        log: TraceLog,
    }

    #[async_trait]
    impl RequestPostProcessor<Ping> for Audit {
        async fn process(
            &self,
            _request: &Ping,
            response: &Pong,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.log.push(format!("audited {}", response.message));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pre_processor_rejects_before_handler() {
        let log = TraceLog::new();
        let pre: Arc<dyn PipelineBehavior<Ping>> =
            Arc::new(PreProcessorBehavior::new(vec![Arc::new(Validate)]));
        let chain = compose(handler(&log), &[pre]);

        let err = chain
            .invoke(
                &Ping {
                    message: String::new(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "message required");
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_post_processor_sees_response() {
        let log = TraceLog::new();
        let post: Arc<dyn PipelineBehavior<Ping>> =
            Arc::new(PostProcessorBehavior::new(vec![Arc::new(Audit {
                log: log.clone(),
            })]));
        let chain = compose(handler(&log), &[post]);

        chain.invoke(&ping(), CancellationToken::new()).await.unwrap();

        assert_eq!(log.entries(), vec!["Handler", "audited Ping Pong"]);
    }

    #[tokio::test]
    async fn test_tracing_behavior_is_transparent() {
        let log = TraceLog::new();
        let chain = compose(handler(&log), &[Arc::new(TracingBehavior)]);

        let pong = chain.invoke(&ping(), CancellationToken::new()).await.unwrap();

        assert_eq!(pong, Pong { message: "Ping Pong".into() });
    }

    struct TokenSwap {
        replacement: CancellationToken,
    }

    #[async_trait]
    impl PipelineBehavior<Ping> for TokenSwap {
        async fn handle(
            &self,
            _request: &Ping,
            next: Next<'_, Ping>,
            _cancel: &CancellationToken,
        ) -> Result<Pong> {
            next.run_with_token(self.replacement.clone()).await
        }
    }

    struct ReportsCancellation;

    #[async_trait]
    impl RequestHandler<Ping> for ReportsCancellation {
        async fn handle(&self, _request: &Ping, cancel: &CancellationToken) -> Result<Pong> {
            Ok(Pong {
                message: cancel.is_cancelled().to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_cancellation_token_reaches_handler() {
        let replacement = CancellationToken::new();
        replacement.cancel();
        let chain = compose(
            Binding::new(
                "ReportsCancellation",
                Arc::new(ReportsCancellation) as Arc<dyn RequestHandler<Ping>>,
            ),
            &[Arc::new(TokenSwap { replacement })],
        );

        let pong = chain.invoke(&ping(), CancellationToken::new()).await.unwrap();

        assert_eq!(pong.message, "true");
    }
}
