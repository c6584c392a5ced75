//! Request dispatcher — drives one fetch-and-parse call end to end: look
//! up the fetcher, borrow a worker, run it, always return the worker,
//! emit exactly one reply.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::warn;

use crate::domain::{FetchReply, FetchRequest, ReplyStatus};
use crate::registry::FetcherRegistry;
use crate::worker::{PoolError, WorkerPool};

#[derive(Clone)]
pub struct Dispatcher {
    registry: FetcherRegistry,
    pool: WorkerPool,
    request_timeout_ceiling: Duration,
}

impl Dispatcher {
    pub fn new(registry: FetcherRegistry, pool: WorkerPool, request_timeout_ceiling: Duration) -> Self {
        Self {
            registry,
            pool,
            request_timeout_ceiling,
        }
    }

    /// Runs one request to completion. `cancelled` is a watch channel the
    /// caller flips to `true` to cancel; it is observed both while waiting
    /// for a worker and while the worker is running.
    pub async fn dispatch(
        &self,
        request: FetchRequest,
        caller_deadline: Option<Duration>,
        cancelled: watch::Receiver<bool>,
    ) -> FetchReply {
        let started = Instant::now();
        let reply = self.dispatch_inner(request, caller_deadline, cancelled).await;
        metrics::histogram!("tika_pipes_dispatch_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        reply
    }

    async fn dispatch_inner(
        &self,
        request: FetchRequest,
        caller_deadline: Option<Duration>,
        cancelled: watch::Receiver<bool>,
    ) -> FetchReply {
        let Some(fetcher) = self.registry.get_config(&request.fetcher_id) else {
            return FetchReply::error(
                &request,
                ReplyStatus::FetchException,
                format!("unknown or expired fetcherId: {}", request.fetcher_id),
            );
        };

        let timeout = match caller_deadline {
            Some(d) => d.min(self.request_timeout_ceiling),
            None => self.request_timeout_ceiling,
        };

        let mut pooled = match self.pool.borrow(wait_for_cancel(cancelled.clone())).await {
            Ok(pooled) => pooled,
            Err(PoolError::ShuttingDown) => {
                return FetchReply::error(&request, ReplyStatus::ClientUnavailable, "worker pool is shutting down");
            }
            Err(PoolError::Cancelled) => {
                return FetchReply::error(
                    &request,
                    ReplyStatus::ClientUnavailable,
                    "request cancelled while waiting for a worker",
                );
            }
        };

        let reply = tokio::select! {
            biased;
            reply = pooled.worker_mut().run_once(&request, &fetcher, timeout) => reply,
            () = wait_for_cancel(cancelled) => {
                warn!(fetch_key = %request.fetch_key, "caller cancelled mid-request, terminating worker subprocess");
                pooled.worker_mut().shutdown().await;
                FetchReply::error(&request, ReplyStatus::ClientUnavailable, "request cancelled")
            }
        };

        pooled.release().await;
        reply
    }
}

async fn wait_for_cancel(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::registry::RegistryConfig;
    use crate::worker::protocol::{ChildReplyFrame, ChildRequestFrame, FrameError};
    use crate::worker::{ChildHandle, ChildSpawner, WorkerConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct EchoChild;

    #[async_trait]
    impl ChildHandle for EchoChild {
        async fn send_request(&mut self, _request: &ChildRequestFrame) -> Result<(), FrameError> {
            Ok(())
        }
        async fn read_reply(&mut self) -> Result<ChildReplyFrame, FrameError> {
            Ok(ChildReplyFrame {
                status: "PARSE_SUCCESS".into(),
                fields: HashMap::new(),
                error_message: String::new(),
            })
        }
        async fn terminate(&mut self, _grace: Duration) {}
        async fn kill(&mut self) {}
        async fn has_exited(&mut self) -> bool {
            false
        }
    }

    struct StallingChild {
        stall: Duration,
    }

    #[async_trait]
    impl ChildHandle for StallingChild {
        async fn send_request(&mut self, _request: &ChildRequestFrame) -> Result<(), FrameError> {
            Ok(())
        }
        async fn read_reply(&mut self) -> Result<ChildReplyFrame, FrameError> {
            tokio::time::sleep(self.stall).await;
            Ok(ChildReplyFrame {
                status: "PARSE_SUCCESS".into(),
                fields: HashMap::new(),
                error_message: String::new(),
            })
        }
        async fn terminate(&mut self, _grace: Duration) {}
        async fn kill(&mut self) {}
        async fn has_exited(&mut self) -> bool {
            false
        }
    }

    struct EchoSpawner;

    #[async_trait]
    impl ChildSpawner for EchoSpawner {
        async fn spawn(&self) -> std::io::Result<Box<dyn ChildHandle>> {
            Ok(Box::new(EchoChild))
        }
    }

    struct StallingSpawner {
        stall: Duration,
    }

    #[async_trait]
    impl ChildSpawner for StallingSpawner {
        async fn spawn(&self) -> std::io::Result<Box<dyn ChildHandle>> {
            Ok(Box::new(StallingChild { stall: self.stall }))
        }
    }

    fn request(fetcher_id: &str, key: &str) -> FetchRequest {
        FetchRequest {
            fetcher_id: fetcher_id.into(),
            fetch_key: key.into(),
            metadata: HashMap::new(),
            request_id: "r1".into(),
        }
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn missing_fetcher_yields_fetch_exception_without_touching_the_pool() {
        let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
        let pool = WorkerPool::new(1, Arc::new(EchoSpawner), WorkerConfig::default());
        let dispatcher = Dispatcher::new(registry, pool, Duration::from_secs(1));

        let reply = dispatcher
            .dispatch(request("missing", "k"), None, never_cancelled())
            .await;
        assert_eq!(reply.status, ReplyStatus::FetchException);
        assert!(!reply.error_message.is_empty());
    }

    #[tokio::test]
    async fn happy_path_looks_up_borrows_runs_and_returns_worker() {
        let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
        registry.save("f1", "FileSystemFetcher", "{}").unwrap();
        let pool = WorkerPool::new(1, Arc::new(EchoSpawner), WorkerConfig::default());
        let dispatcher = Dispatcher::new(registry, pool.clone(), Duration::from_secs(1));

        let reply = dispatcher
            .dispatch(request("f1", "test-0.html"), None, never_cancelled())
            .await;
        assert_eq!(reply.status, ReplyStatus::ParseSuccess);
        assert_eq!(pool.busy_count(), 0, "worker must be returned to the pool");
    }

    #[tokio::test]
    async fn caller_deadline_shorter_than_ceiling_wins() {
        let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
        registry.save("f1", "FileSystemFetcher", "{}").unwrap();
        let pool = WorkerPool::new(1, Arc::new(StallingSpawner { stall: Duration::from_millis(200) }), WorkerConfig::default());
        let dispatcher = Dispatcher::new(registry, pool, Duration::from_secs(10));

        let reply = dispatcher
            .dispatch(request("f1", "slow"), Some(Duration::from_millis(20)), never_cancelled())
            .await;
        assert_eq!(reply.status, ReplyStatus::Timeout, "caller's tighter deadline must be honored, not the 10s ceiling");
    }

    #[tokio::test]
    async fn cancelling_while_waiting_for_a_worker_yields_client_unavailable() {
        let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
        registry.save("f1", "FileSystemFetcher", "{}").unwrap();
        let pool = WorkerPool::new(1, Arc::new(StallingSpawner { stall: Duration::from_secs(5) }), WorkerConfig::default());
        let dispatcher = Dispatcher::new(registry, pool.clone(), Duration::from_secs(30));

        let held = pool.borrow(std::future::pending()).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let dispatcher2 = dispatcher.clone();
        let waiting = tokio::spawn(async move {
            dispatcher2.dispatch(request("f1", "k"), None, rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let reply = waiting.await.unwrap();
        assert_eq!(reply.status, ReplyStatus::ClientUnavailable);
        held.release().await;
    }
}
