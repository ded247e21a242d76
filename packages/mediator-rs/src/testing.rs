//! Testing utilities for mediator pipelines.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! mediator = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Asserting Behavior Order
//!
//! Hand a clone of one [`TraceLog`] to every behavior and handler, then
//! compare the entries after dispatch:
//!
//! ```ignore
//! use mediator::testing::TraceLog;
//!
//! let log = TraceLog::new();
//! registry.add_behavior::<Ping, _>(Outer { log: log.clone() });
//! registry.add_request_handler::<Ping, _>(PingHandler { log: log.clone() });
//!
//! mediator.send(Ping::new("Ping")).await?;
//!
//! assert_eq!(log.entries(), vec!["Outer before", "Handler", "Outer after"]);
//! ```
//!
//! # Asserting Stream Cleanup
//!
//! ```ignore
//! use mediator::testing::DropFlag;
//!
//! let released = DropFlag::new();
//! // inside the stream handler: let _guard = self.released.guard();
//!
//! let mut stream = mediator.create_stream(Countdown { from: 10 });
//! stream.next().await;
//! drop(stream);
//!
//! assert!(released.is_set());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared, ordered log of string entries.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl TraceLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.into());
    }

    /// Snapshot of every entry, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Remove and return every entry.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Returns true if nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Records that a resource guard was dropped.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct DropFlag {
    set: Arc<AtomicBool>,
}

impl DropFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard that sets the flag when dropped.
    pub fn guard(&self) -> DropGuard {
        DropGuard {
            flag: self.set.clone(),
        }
    }

    /// Returns true once a guard has been dropped.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }
}

/// Sets its [`DropFlag`] on drop.
#[derive(Debug)]
pub struct DropGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}
