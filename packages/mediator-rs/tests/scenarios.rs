//! End-to-end scenarios through the public API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_stream::stream;
use futures::StreamExt;
use mediator::{
    async_trait, error_class, AnyMessage, BoxStream, CancellationToken, ExceptionState, Mediator,
    MediatorBuilder, MediatorConfig, MediatorError, Next, Notification, NotificationHandler,
    PipelineBehavior, PublishStrategy, Request, RequestExceptionAction, RequestExceptionHandler,
    RequestHandler, ServiceRegistry, StreamRequest, StreamRequestHandler,
};
use thiserror::Error;

// =============================================================================
// Shared Log
// =============================================================================

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug)]
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
    log: Log,
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

struct Outer {
    log: Log,
}

#[async_trait]
impl PipelineBehavior<Ping> for Outer {
    async fn handle(
        &self,
        _request: &Ping,
        next: Next<'_, Ping>,
        _cancel: &CancellationToken,
    ) -> Result<Pong> {
        self.log.push("Outer before");
        let response = next.run().await;
        self.log.push("Outer after");
        response
    }
}

struct Inner {
    log: Log,
}

#[async_trait]
impl PipelineBehavior<Ping> for Inner {
    async fn handle(
        &self,
        _request: &Ping,
        next: Next<'_, Ping>,
        _cancel: &CancellationToken,
    ) -> Result<Pong> {
        self.log.push("Inner before");
        let response = next.run().await;
        self.log.push("Inner after");
        response
    }
}

fn ping_mediator(log: &Log) -> Mediator {
    MediatorBuilder::new()
        .with_request_handler::<Ping, _>(PingHandler { log: log.clone() })
        .with_behavior::<Ping, _>(Outer { log: log.clone() })
        .with_behavior::<Ping, _>(Inner { log: log.clone() })
        .build()
}

#[tokio::test]
async fn ping_is_wrapped_by_outer_then_inner() {
    let log = Log::default();
    let mediator = ping_mediator(&log);

    let pong = mediator
        .send(Ping {
            message: "Ping".into(),
        })
        .await
        .unwrap();

    assert_eq!(
        pong,
        Pong {
            message: "Ping Pong".into()
        }
    );
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
async fn ping_held_as_any_routes_to_its_handler() {
    let log = Log::default();
    let mediator = ping_mediator(&log);
    let request: AnyMessage = Box::new(Ping {
        message: "Ping".into(),
    });

    let response = mediator
        .send_any(Some(request), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.downcast::<Pong>().unwrap().message, "Ping Pong");
}

#[tokio::test]
async fn missing_message_differs_from_missing_handler() {
    let mediator = Mediator::new(ServiceRegistry::new());

    let missing = mediator
        .send_any(None, CancellationToken::new())
        .await
        .unwrap_err();
    let unhandled = mediator
        .send(Ping {
            message: "Ping".into(),
        })
        .await
        .unwrap_err();

    assert!(matches!(
        missing.downcast_ref::<MediatorError>(),
        Some(MediatorError::MissingMessage)
    ));
    assert!(matches!(
        unhandled.downcast_ref::<MediatorError>(),
        Some(MediatorError::HandlerNotFound { .. })
    ));
}

// =============================================================================
// Notifications
// =============================================================================

struct Pinged {
    message: String,
}

impl Notification for Pinged {}

struct Appender {
    suffix: &'static str,
    log: Log,
}

#[async_trait]
impl NotificationHandler<Pinged> for Appender {
    async fn handle(&self, notification: &Pinged, _cancel: &CancellationToken) -> Result<()> {
        self.log
            .push(format!("{}{}", notification.message, self.suffix));
        Ok(())
    }
}

fn pinged_mediator(log: &Log, config: MediatorConfig) -> Mediator {
    MediatorBuilder::new()
        .config(config)
        .with_notification_handler::<Pinged, _>(Appender {
            suffix: " Pong",
            log: log.clone(),
        })
        .with_notification_handler::<Pinged, _>(Appender {
            suffix: " Pung",
            log: log.clone(),
        })
        .build()
}

#[tokio::test]
async fn pinged_reaches_both_handlers_in_order() {
    let log = Log::default();
    let mediator = pinged_mediator(&log, MediatorConfig::default());

    mediator
        .publish(Pinged {
            message: "Ping".into(),
        })
        .await
        .unwrap();

    assert_eq!(log.entries(), vec!["Ping Pong", "Ping Pung"]);
}

#[tokio::test]
async fn pinged_reaches_both_handlers_concurrently() {
    let log = Log::default();
    let config = MediatorConfig::from_json(r#"{ "publish_strategy": "concurrent" }"#).unwrap();
    assert_eq!(config.publish_strategy, PublishStrategy::Concurrent);
    let mediator = pinged_mediator(&log, config);

    mediator
        .publish(Pinged {
            message: "Ping".into(),
        })
        .await
        .unwrap();

    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.contains(&"Ping Pong".to_string()));
    assert!(entries.contains(&"Ping Pung".to_string()));
}

// =============================================================================
// Exception Routing
// =============================================================================

#[derive(Debug, Error)]
#[error("{0} Thrown")]
struct PingException(String);

#[derive(Debug, Error)]
#[error("{0} Thrown")]
struct PongException(String);

enum PingPongException {}

error_class!(family PingPongException => anyhow::Error; PingException, PongException);
error_class!(PingException => PingPongException);
error_class!(PongException => PingPongException);

struct ThrowingPing {
    message: String,
}

impl Request for ThrowingPing {
    type Response = Pong;
}

struct ThrowingHandler;

#[async_trait]
impl RequestHandler<ThrowingPing> for ThrowingHandler {
    async fn handle(&self, request: &ThrowingPing, _cancel: &CancellationToken) -> Result<Pong> {
        Err(PingException(request.message.clone()).into())
    }
}

struct CountingAction {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl RequestExceptionAction<ThrowingPing> for CountingAction {
    async fn execute(
        &self,
        _request: &ThrowingPing,
        _error: &anyhow::Error,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Resolve {
    label: &'static str,
    ran: Arc<AtomicBool>,
}

#[async_trait]
impl RequestExceptionHandler<ThrowingPing> for Resolve {
    async fn handle(
        &self,
        _request: &ThrowingPing,
        error: &anyhow::Error,
        state: &mut ExceptionState<Pong>,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.ran.store(true, Ordering::SeqCst);
        state.set_handled(Pong {
            message: format!("{} Handled by {}", error, self.label),
        });
        Ok(())
    }
}

fn throwing() -> ThrowingPing {
    ThrowingPing {
        message: "Ping".into(),
    }
}

#[tokio::test]
async fn exact_and_ancestor_actions_run_but_sibling_does_not() {
    let exact = Arc::new(AtomicUsize::new(0));
    let ancestor = Arc::new(AtomicUsize::new(0));
    let sibling = Arc::new(AtomicUsize::new(0));
    let mediator = MediatorBuilder::new()
        .with_request_handler::<ThrowingPing, _>(ThrowingHandler)
        .with_exception_action::<ThrowingPing, PingException, _>(CountingAction {
            runs: exact.clone(),
        })
        .with_exception_action::<ThrowingPing, PingPongException, _>(CountingAction {
            runs: ancestor.clone(),
        })
        .with_exception_action::<ThrowingPing, PongException, _>(CountingAction {
            runs: sibling.clone(),
        })
        .build();

    let err = mediator.send(throwing()).await.unwrap_err();

    assert!(err.downcast_ref::<PingException>().is_some());
    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(ancestor.load(Ordering::SeqCst), 1);
    assert_eq!(sibling.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exact_handler_wins_over_general_one() {
    let exact_ran = Arc::new(AtomicBool::new(false));
    let general_ran = Arc::new(AtomicBool::new(false));
    let mediator = MediatorBuilder::new()
        .with_request_handler::<ThrowingPing, _>(ThrowingHandler)
        .with_exception_handler::<ThrowingPing, anyhow::Error, _>(Resolve {
            label: "General",
            ran: general_ran.clone(),
        })
        .with_exception_handler::<ThrowingPing, PingException, _>(Resolve {
            label: "Exact",
            ran: exact_ran.clone(),
        })
        .build();

    let pong = mediator.send(throwing()).await.unwrap();

    assert_eq!(pong.message, "Ping Thrown Handled by Exact");
    assert!(exact_ran.load(Ordering::SeqCst));
    assert!(!general_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn general_handler_alone_resolves() {
    let ran = Arc::new(AtomicBool::new(false));
    let mediator = MediatorBuilder::new()
        .with_request_handler::<ThrowingPing, _>(ThrowingHandler)
        .with_exception_handler::<ThrowingPing, anyhow::Error, _>(Resolve {
            label: "General",
            ran: ran.clone(),
        })
        .build();

    let pong = mediator.send(throwing()).await.unwrap();

    assert_eq!(pong.message, "Ping Thrown Handled by General");
    assert!(ran.load(Ordering::SeqCst));
}

// =============================================================================
// Streams
// =============================================================================

struct Sing {
    verses: usize,
}

impl StreamRequest for Sing {
    type Item = String;
}

struct Released(Arc<AtomicBool>);

impl Drop for Released {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct SingHandler {
    released: Arc<AtomicBool>,
}

impl StreamRequestHandler<Sing> for SingHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Sing,
        _cancel: CancellationToken,
    ) -> BoxStream<'a, Result<String>> {
        Box::pin(stream! {
            let _released = Released(self.released.clone());
            for verse in 1..=request.verses {
                yield Ok(format!("verse {verse}"));
            }
        })
    }
}

#[tokio::test]
async fn taking_only_the_first_item_releases_the_handler() {
    let released = Arc::new(AtomicBool::new(false));
    let mediator = MediatorBuilder::new()
        .with_stream_handler::<Sing, _>(SingHandler {
            released: released.clone(),
        })
        .build();

    let first: Vec<String> = mediator
        .create_stream(Sing { verses: 10 })
        .take(1)
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(first, vec!["verse 1"]);
    assert!(released.load(Ordering::SeqCst));
}
