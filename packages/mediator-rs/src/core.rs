//! Core message traits for the mediator.
//!
//! # Overview
//!
//! The mediator routes three kinds of message:
//! - [`Request`] = exactly one handler, exactly one response
//! - [`StreamRequest`] = exactly one handler, a lazy sequence of items
//! - [`Notification`] = zero or more handlers, no response
//!
//! A message's identity is its concrete Rust type. Both calling conventions
//! (statically typed `send::<R>` and the type-erased `send_any`) resolve
//! handlers through the `TypeId` of that concrete type.
//!
//! # Void Requests
//!
//! Requests that produce no value use `()` as their response. The pipeline
//! machinery treats `()` like any other response type:
//!
//! ```ignore
//! struct Ping { message: String }
//!
//! impl Request for Ping {
//!     type Response = ();
//! }
//! ```

use std::any::{Any, TypeId};
use std::fmt;

/// A message that expects exactly one response from exactly one handler.
///
/// # Example
///
/// ```ignore
/// use mediator::Request;
///
/// struct Ping { message: String }
/// struct Pong { message: String }
///
/// impl Request for Ping {
///     type Response = Pong;
/// }
/// ```
pub trait Request: Send + Sync + 'static {
    /// The value the handler produces. Use `()` for void-like requests.
    type Response: Send + 'static;
}

/// A message whose single handler yields a lazy sequence of items.
pub trait StreamRequest: Send + Sync + 'static {
    /// The element type of the produced sequence.
    type Item: Send + 'static;
}

/// A message broadcast to zero or more independent subscribers.
///
/// Having no subscribers bound is not an error.
pub trait Notification: Send + Sync + 'static {}

/// A message whose static type is unknown at the call site.
///
/// Used by the dynamic dispatch path (`send_any`, `publish_any`,
/// `create_stream_any`). The message is routed by its concrete runtime type,
/// not by the type of the variable holding it.
pub type AnyMessage = Box<dyn Any + Send + Sync>;

/// Type-erased response returned by the dynamic `send_any` path.
///
/// Downcast to the request's `Response` type to read it.
pub type AnyResponse = Box<dyn Any + Send>;

/// Type-erased stream element returned by `create_stream_any`.
pub type AnyItem = Box<dyn Any + Send>;

/// Runtime identity of a message type.
///
/// Carries the `TypeId` used as the cache key plus a readable name for
/// errors and logs. `TypeId` alone does not preserve the name at runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Identity of the concrete type `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Identity of an erased message, using its concrete runtime type.
    ///
    /// The name is not recoverable from a `dyn Any`, so it reads `"unknown"`.
    pub fn of_erased(message: &(dyn Any + Send + Sync)) -> Self {
        Self {
            id: message.type_id(),
            name: "unknown",
        }
    }

    /// The `TypeId` of the message type.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The type name, or `"unknown"` for erased messages.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageType").field(&self.name).finish()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
