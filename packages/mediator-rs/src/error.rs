//! Structured error types for the mediator.
//!
//! `MediatorError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handlers and behaviors return `anyhow::Result`; the
//! mediator surfaces its own failures as `MediatorError` values inside that
//! same `anyhow::Error`, so callers tell them apart by downcasting.
//!
//! # Error Taxonomy
//!
//! - **Configuration**: `HandlerNotFound`, `AmbiguousHandler`, `InvalidConfig`
//! - **Caller**: `MissingMessage`, `MessageTypeMismatch`
//! - **Handler**: whatever the handler returned, or `HandlerPanicked`
//! - **Secondary**: whatever an exception handler or action returned, or
//!   `ExceptionHandlerPanicked` / `ExceptionActionPanicked`
//!
//! # Example
//!
//! ```ignore
//! use mediator::MediatorError;
//!
//! match mediator.send(Ping::new("Ping")).await {
//!     Ok(pong) => println!("{}", pong.message),
//!     Err(e) => match e.downcast_ref::<MediatorError>() {
//!         Some(MediatorError::HandlerNotFound { message_type }) => {
//!             eprintln!("nothing handles {}", message_type);
//!         }
//!         // Not a mediator error: the handler ran and failed
//!         _ => eprintln!("handler failed: {e:#}"),
//!     },
//! }
//! ```

use std::any::Any;

use thiserror::Error;

use crate::core::MessageType;

/// Structured error type for mediator operations.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// No handler is bound for the concrete message type.
    #[error("no handler registered for message type {message_type}")]
    HandlerNotFound {
        /// The message type that has no handler.
        message_type: MessageType,
    },

    /// More than one handler is bound for a request type.
    #[error("{count} handlers registered for message type {message_type}, expected exactly one")]
    AmbiguousHandler {
        /// The message type with conflicting handlers.
        message_type: MessageType,
        /// How many handlers were found.
        count: usize,
    },

    /// The message argument was absent.
    #[error("message must not be empty")]
    MissingMessage,

    /// A type-erased message did not have the type its wrapper expected
    /// (internal error).
    #[error("message type mismatch: expected {expected}")]
    MessageTypeMismatch {
        /// Expected type name.
        expected: &'static str,
    },

    /// A request or stream handler panicked.
    #[error("handler {handler} panicked: {message}")]
    HandlerPanicked {
        /// Type name of the handler.
        handler: &'static str,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// An exception handler panicked while processing another error.
    #[error("exception handler {handler} panicked: {message}")]
    ExceptionHandlerPanicked {
        /// Type name of the exception handler.
        handler: &'static str,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// An exception action panicked while observing another error.
    #[error("exception action {action} panicked: {message}")]
    ExceptionActionPanicked {
        /// Type name of the exception action.
        action: &'static str,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// The operation observed its cancellation token.
    #[error("operation was cancelled")]
    Cancelled,

    /// One or more notification handlers failed under an aggregating
    /// publish strategy.
    #[error("{} notification handler(s) failed", .failures.len())]
    PublishFailed {
        /// Every failure, in handler order.
        failures: Vec<anyhow::Error>,
    },

    /// Configuration could not be parsed.
    #[error("invalid mediator configuration: {message}")]
    InvalidConfig {
        /// The underlying parse error message.
        message: String,
    },
}

impl MediatorError {
    /// Returns true for errors raised before any handler ran.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            MediatorError::HandlerNotFound { .. }
                | MediatorError::AmbiguousHandler { .. }
                | MediatorError::MissingMessage
                | MediatorError::MessageTypeMismatch { .. }
        )
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
