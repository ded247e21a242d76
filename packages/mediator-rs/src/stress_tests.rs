//! Stress tests for concurrent first use of the mediator.
//!
//! Many tasks dispatch a type nobody has dispatched before, at the same
//! time, on a multi-threaded runtime. Each must see a fully built wrapper
//! and the chain must not pick up duplicate stages.

#[cfg(test)]
mod stress_tests {
    use crate::core::{Notification, Request, StreamRequest};
    use crate::handler::{NotificationHandler, RequestHandler, StreamRequestHandler};
    use crate::mediator::{Mediator, MediatorBuilder};
    use crate::pipeline::{Next, PipelineBehavior};
    use crate::testing::TraceLog;
    use anyhow::Result;
    use async_stream::stream;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const TASKS: usize = 64;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    struct Ping {
        id: usize,
    }

    impl Request for Ping {
        type Response = usize;
    }

    struct Pinged;

    impl Notification for Pinged {}

    struct Ticks {
        count: usize,
    }

    impl StreamRequest for Ticks {
        type Item = usize;
    }

    struct PingHandler;

    #[async_trait]
    impl RequestHandler<Ping> for PingHandler {
        async fn handle(&self, request: &Ping, _cancel: &CancellationToken) -> Result<usize> {
            jitter().await;
            Ok(request.id)
        }
    }

    /// Counts how many times it wraps a dispatch.
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PipelineBehavior<Ping> for Counting {
        async fn handle(
            &self,
            _request: &Ping,
            next: Next<'_, Ping>,
            _cancel: &CancellationToken,
        ) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            next.run().await
        }
    }

    struct Recorder {
        log: TraceLog,
    }

    #[async_trait]
    impl NotificationHandler<Pinged> for Recorder {
        async fn handle(&self, _notification: &Pinged, _cancel: &CancellationToken) -> Result<()> {
            jitter().await;
            self.log.push("seen");
            Ok(())
        }
    }

    struct TicksHandler;

    impl StreamRequestHandler<Ticks> for TicksHandler {
        fn handle<'a>(
            &'a self,
            request: &'a Ticks,
            _cancel: CancellationToken,
        ) -> BoxStream<'a, Result<usize>> {
            Box::pin(stream! {
                for n in 0..request.count {
                    yield Ok(n);
                }
            })
        }
    }

    async fn jitter() {
        tokio::time::sleep(Duration::from_micros(fastrand::u64(0..500))).await;
    }

    // ==========================================================================
    // Concurrent First Use
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_send_converges_on_one_wrapper() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mediator = MediatorBuilder::new()
            .with_request_handler::<Ping, _>(PingHandler)
            .with_behavior::<Ping, _>(Counting {
                calls: calls.clone(),
            })
            .build();

        let handles: Vec<_> = (0..TASKS)
            .map(|id| {
                let mediator = mediator.clone();
                tokio::spawn(async move {
                    jitter().await;
                    mediator.send(Ping { id }).await
                })
            })
            .collect();

        for (id, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), id);
        }

        // One behavior invocation per dispatch: no duplicated stages
        assert_eq!(calls.load(Ordering::SeqCst), TASKS);
        assert_eq!(mediator.cached_wrapper_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_send_any_converges_on_one_wrapper() {
        let mediator = MediatorBuilder::new()
            .with_request_handler::<Ping, _>(PingHandler)
            .build();

        let handles: Vec<_> = (0..TASKS)
            .map(|id| {
                let mediator = mediator.clone();
                tokio::spawn(async move {
                    let response = mediator
                        .send_any(Some(Box::new(Ping { id })), CancellationToken::new())
                        .await?;
                    response
                        .downcast::<usize>()
                        .map(|id| *id)
                        .map_err(|_| anyhow::anyhow!("unexpected response type"))
                })
            })
            .collect();

        for (id, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), id);
        }
        assert_eq!(mediator.cached_wrapper_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_publish_reaches_every_handler() {
        let log = TraceLog::new();
        let mediator = MediatorBuilder::new()
            .with_notification_handler::<Pinged, _>(Recorder { log: log.clone() })
            .with_notification_handler::<Pinged, _>(Recorder { log: log.clone() })
            .build();

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let mediator = mediator.clone();
                tokio::spawn(async move { mediator.publish(Pinged).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(log.len(), TASKS * 2);
        assert_eq!(mediator.cached_wrapper_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mixed_kinds_each_get_their_own_wrapper() {
        let mediator: Mediator = MediatorBuilder::new()
            .with_request_handler::<Ping, _>(PingHandler)
            .with_notification_handler::<Pinged, _>(Recorder {
                log: TraceLog::new(),
            })
            .with_stream_handler::<Ticks, _>(TicksHandler)
            .build();

        let handles: Vec<_> = (0..TASKS)
            .map(|id| {
                let mediator = mediator.clone();
                tokio::spawn(async move {
                    match id % 3 {
                        0 => mediator.send(Ping { id }).await.map(|_| ()),
                        1 => mediator.publish(Pinged).await,
                        _ => {
                            let items: Vec<_> =
                                mediator.create_stream(Ticks { count: 3 }).collect().await;
                            assert_eq!(items.len(), 3);
                            Ok(())
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(mediator.cached_wrapper_count(), 3);
    }
}
