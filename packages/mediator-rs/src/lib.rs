//! # Mediator
//!
//! An in-process dispatcher: callers submit a typed request or notification
//! and the mediator routes it to the right handler(s), wrapping the call in
//! an ordered chain of cross-cutting behaviors.
//!
//! ## Core Concepts
//!
//! - [`Request`] = exactly one handler, exactly one response
//! - [`StreamRequest`] = exactly one handler, a lazy sequence of items
//! - [`Notification`] = zero or more handlers, no response
//!
//! Behaviors ([`PipelineBehavior`], [`StreamPipelineBehavior`]) wrap the
//! handler like layers of an onion: the first registered behavior is the
//! outermost layer. Exception handlers and actions sit around the whole
//! chain and decide what happens when it fails.
//!
//! ## Architecture
//!
//! ```text
//! send(Ping) / send_any(Box<dyn Any>)
//!     │
//!     ▼
//! WrapperCache[TypeId] ──miss──► resolve from ServiceRegistry, compose once
//!     │ hit
//!     ▼
//! ExceptionActionBehavior           (observes, rethrows)
//!     │
//!     ▼
//! ExceptionHandlerBehavior          (may substitute a response)
//!     │
//!     ▼
//! pre-processors ─► post-processors ─► Behavior 1 ─► Behavior 2 ─► Handler
//!
//! publish(Pinged) ──► WrapperCache[TypeId] ──► NotificationPublisher
//!                                                ├─► Handler A
//!                                                └─► Handler B
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One request type = one handler** - zero or several fail the dispatch
//! 2. **Zero notification handlers is fine** - publish completes normally
//! 3. **Wrappers are built once per type** - concurrent first use converges
//!    on a single instance
//! 4. **Behavior order is registration order** - stable across calls
//! 5. **Secondary errors are never dropped** - a failing exception handler
//!    or action replaces the original error
//!
//! ## Example
//!
//! ```ignore
//! use mediator::{async_trait, CancellationToken, MediatorBuilder, Next, PipelineBehavior,
//!     Request, RequestHandler};
//!
//! struct Ping { message: String }
//! struct Pong { message: String }
//!
//! impl Request for Ping {
//!     type Response = Pong;
//! }
//!
//! struct PingHandler;
//!
//! #[async_trait]
//! impl RequestHandler<Ping> for PingHandler {
//!     async fn handle(&self, request: &Ping, _cancel: &CancellationToken) -> anyhow::Result<Pong> {
//!         Ok(Pong { message: format!("{} Pong", request.message) })
//!     }
//! }
//!
//! let mediator = MediatorBuilder::new()
//!     .with_request_handler::<Ping, _>(PingHandler)
//!     .with_behavior::<Ping, _>(mediator::TracingBehavior)
//!     .build();
//!
//! let pong = mediator.send(Ping { message: "Ping".into() }).await?;
//! assert_eq!(pong.message, "Ping Pong");
//! ```
//!
//! ## What This Is Not
//!
//! Not a distributed message bus. Delivery is in-process and in-memory,
//! with no persistence, retries or cross-process addressing.

// Core modules
mod config;
mod core;
mod error;
mod exception;
mod handler;
mod mediator;
mod pipeline;
mod publish;
mod registry;
mod stream;
mod wrapper;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export message traits
pub use crate::core::{
    AnyItem, AnyMessage, AnyResponse, MessageType, Notification, Request, StreamRequest,
};

// Re-export error types
pub use crate::error::MediatorError;

// Re-export handler traits
pub use handler::{NotificationHandler, RequestHandler, StreamRequestHandler};

// Re-export pipeline types
pub use pipeline::{
    Next, PipelineBehavior, RequestPostProcessor, RequestPreProcessor, TracingBehavior,
};
pub use stream::{StreamNext, StreamPipelineBehavior};

// Re-export exception routing types
pub use exception::{
    ErrorClass, ErrorClassInfo, ExceptionActionBinding, ExceptionActionStrategy,
    ExceptionHandlerBinding, ExceptionState, RequestExceptionAction, RequestExceptionHandler,
};

// Re-export publish types
pub use publish::{
    ConcurrentPublisher, ContinueOnErrorPublisher, NotificationHandlerExecutor,
    NotificationPublisher, SequentialPublisher,
};

// Re-export registry and configuration
pub use config::{MediatorConfig, PublishStrategy};
pub use registry::{Binding, ServiceRegistry};

// Re-export the facade (primary entry point)
pub use mediator::{Mediator, MediatorBuilder};

// Re-export commonly used external types
pub use anyhow;
pub use async_trait::async_trait;
pub use futures::stream::BoxStream;
pub use tokio_util::sync::CancellationToken;
