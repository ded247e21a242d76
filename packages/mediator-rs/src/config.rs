//! Mediator configuration.
//!
//! Everything here has a default, so `MediatorConfig::default()` is a valid
//! configuration. Loading from JSON accepts any subset of the fields:
//!
//! ```json
//! {
//!   "exception_action_strategy": "apply_for_all_exceptions",
//!   "publish_strategy": "continue_on_error"
//! }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MediatorError;
use crate::exception::ExceptionActionStrategy;
use crate::publish::{
    ConcurrentPublisher, ContinueOnErrorPublisher, NotificationPublisher, SequentialPublisher,
};

/// Built-in notification delivery policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// One handler at a time, registration order, stop at the first failure.
    #[default]
    Sequential,
    /// All handlers at once, failures aggregated.
    Concurrent,
    /// One handler at a time, registration order, failures aggregated.
    ContinueOnError,
}

impl PublishStrategy {
    /// The publisher implementing this strategy.
    pub fn publisher(self) -> Arc<dyn NotificationPublisher> {
        match self {
            PublishStrategy::Sequential => Arc::new(SequentialPublisher),
            PublishStrategy::Concurrent => Arc::new(ConcurrentPublisher),
            PublishStrategy::ContinueOnError => Arc::new(ContinueOnErrorPublisher),
        }
    }
}

/// Mediator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// Where exception actions sit relative to exception handlers.
    pub exception_action_strategy: ExceptionActionStrategy,
    /// How notifications reach their handlers.
    pub publish_strategy: PublishStrategy,
}

impl MediatorConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::InvalidConfig`] for malformed JSON or
    /// unknown strategy names.
    pub fn from_json(json: &str) -> Result<Self, MediatorError> {
        serde_json::from_str(json).map_err(|e| MediatorError::InvalidConfig {
            message: e.to_string(),
        })
    }

    /// Set the exception action strategy.
    pub fn with_exception_action_strategy(mut self, strategy: ExceptionActionStrategy) -> Self {
        self.exception_action_strategy = strategy;
        self
    }

    /// Set the publish strategy.
    pub fn with_publish_strategy(mut self, strategy: PublishStrategy) -> Self {
        self.publish_strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MediatorConfig::default();
        assert_eq!(
            config.exception_action_strategy,
            ExceptionActionStrategy::ApplyForUnhandledExceptions
        );
        assert_eq!(config.publish_strategy, PublishStrategy::Sequential);
    }

    #[test]
    fn test_from_json_reads_every_field() {
        let config = MediatorConfig::from_json(
            r#"{
                "exception_action_strategy": "apply_for_all_exceptions",
                "publish_strategy": "continue_on_error"
            }"#,
        )
        .unwrap();

        assert_eq!(
            config,
            MediatorConfig::default()
                .with_exception_action_strategy(ExceptionActionStrategy::ApplyForAllExceptions)
                .with_publish_strategy(PublishStrategy::ContinueOnError)
        );
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = MediatorConfig::from_json(r#"{ "publish_strategy": "concurrent" }"#).unwrap();
        assert_eq!(config.publish_strategy, PublishStrategy::Concurrent);
        assert_eq!(
            config.exception_action_strategy,
            ExceptionActionStrategy::ApplyForUnhandledExceptions
        );

        assert_eq!(
            MediatorConfig::from_json("{}").unwrap(),
            MediatorConfig::default()
        );
    }

    #[test]
    fn test_from_json_rejects_unknown_strategy() {
        let err = MediatorConfig::from_json(r#"{ "publish_strategy": "broadcast" }"#).unwrap_err();
        assert!(matches!(err, MediatorError::InvalidConfig { .. }));
        assert!(err.to_string().contains("invalid mediator configuration"));
    }

    #[test]
    fn test_from_json_rejects_malformed_input() {
        let err = MediatorConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, MediatorError::InvalidConfig { .. }));
    }

    #[test]
    fn test_serializes_snake_case() {
        let json = serde_json::to_value(
            MediatorConfig::default().with_publish_strategy(PublishStrategy::ContinueOnError),
        )
        .unwrap();
        assert_eq!(json["publish_strategy"], "continue_on_error");
        assert_eq!(
            json["exception_action_strategy"],
            "apply_for_unhandled_exceptions"
        );
    }
}
