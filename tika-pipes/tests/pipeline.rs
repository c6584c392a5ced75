//! End-to-end scenarios driven entirely through the public API: registry
//! CRUD/TTL, the bidi stream coordinator, and the dispatcher's crash and
//! timeout handling. Each worker talks to a scripted in-process child
//! rather than a real subprocess, the same substitution the unit tests
//! inside the crate use, but exercised here across full request/reply
//! round trips instead of one module at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{mpsc, watch};

use tika_pipes::dispatch::Dispatcher;
use tika_pipes::domain::{FetchRequest, ReplyStatus};
use tika_pipes::registry::{DeletePolicy, FetcherRegistry, RegistryConfig};
use tika_pipes::stream::{run_stream, StreamConfig};
use tika_pipes::worker::protocol::{ChildReplyFrame, ChildRequestFrame, FrameError};
use tika_pipes::worker::{ChildHandle, ChildSpawner, WorkerConfig, WorkerPool};

#[derive(Clone, Copy)]
enum Script {
    Echo,
    Crash,
    Stall(Duration),
}

struct ScriptedChild {
    pending_key: Option<String>,
    script: Arc<dyn Fn(&str) -> Script + Send + Sync>,
}

#[async_trait]
impl ChildHandle for ScriptedChild {
    async fn send_request(&mut self, request: &ChildRequestFrame) -> Result<(), FrameError> {
        self.pending_key = Some(request.fetch_key.clone());
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<ChildReplyFrame, FrameError> {
        let key = self.pending_key.take().unwrap_or_default();
        match (self.script)(&key) {
            Script::Echo => Ok(ChildReplyFrame {
                status: "PARSE_SUCCESS".into(),
                fields: HashMap::from([("key".to_string(), key)]),
                error_message: String::new(),
            }),
            Script::Crash => Err(FrameError::Eof),
            Script::Stall(d) => {
                tokio::time::sleep(d).await;
                Ok(ChildReplyFrame {
                    status: "PARSE_SUCCESS".into(),
                    fields: HashMap::new(),
                    error_message: String::new(),
                })
            }
        }
    }

    async fn terminate(&mut self, _grace: Duration) {}
    async fn kill(&mut self) {}
    async fn has_exited(&mut self) -> bool {
        false
    }
}

struct ScriptedSpawner {
    script: Arc<dyn Fn(&str) -> Script + Send + Sync>,
    spawn_count: AtomicU32,
}

#[async_trait]
impl ChildSpawner for ScriptedSpawner {
    async fn spawn(&self) -> std::io::Result<Box<dyn ChildHandle>> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedChild {
            pending_key: None,
            script: self.script.clone(),
        }))
    }
}

fn echo_spawner() -> Arc<ScriptedSpawner> {
    Arc::new(ScriptedSpawner {
        script: Arc::new(|_| Script::Echo),
        spawn_count: AtomicU32::new(0),
    })
}

fn request(fetcher_id: &str, key: &str, request_id: &str) -> FetchRequest {
    FetchRequest {
        fetcher_id: fetcher_id.into(),
        fetch_key: key.into(),
        metadata: HashMap::new(),
        request_id: request_id.into(),
    }
}

fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn crud_loop_save_get_update_delete_across_ten_fetchers() {
    let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);

    for i in 0..10 {
        let id = format!("fetcher-{i}");
        registry
            .save(&id, "FileSystemFetcher", r#"{"basePath":"/a"}"#)
            .unwrap();
    }
    for i in 0..10 {
        let id = format!("fetcher-{i}");
        let info = registry.get(&id).expect("just saved");
        assert_eq!(info.params.get("basePath").unwrap(), "/a");
    }

    // Save again with a changed option; this must be an in-place replace.
    for i in 0..10 {
        let id = format!("fetcher-{i}");
        registry
            .save(&id, "FileSystemFetcher", r#"{"basePath":"/b"}"#)
            .unwrap();
    }
    for i in 0..10 {
        let id = format!("fetcher-{i}");
        let info = registry.get(&id).expect("still present after re-save");
        assert_eq!(info.params.get("basePath").unwrap(), "/b");
    }

    for i in 0..10 {
        let id = format!("fetcher-{i}");
        assert!(registry.delete(&id));
        assert!(registry.get(&id).is_none());
    }
}

#[tokio::test]
async fn ttl_expiration_only_after_access_stops() {
    let idle_ttl = Duration::from_millis(150);
    let sweep_interval = Duration::from_millis(50);
    let registry = FetcherRegistry::spawn(
        RegistryConfig {
            idle_ttl,
            sweep_interval,
            delete_policy: DeletePolicy::Enabled,
        },
        None,
    );
    registry.save("f1", "FileSystemFetcher", "{}").unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.get("f1").is_some(), "repeated access must keep refreshing the TTL");
    }

    tokio::time::sleep(idle_ttl + sweep_interval + Duration::from_millis(100)).await;
    assert!(registry.get("f1").is_none(), "must expire once access stops");
}

#[tokio::test]
async fn bidi_stream_two_valid_keys_and_one_unknown_fetcher() {
    let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
    registry.save("f1", "FileSystemFetcher", "{}").unwrap();
    let pool = WorkerPool::new(2, echo_spawner(), WorkerConfig::default());
    let dispatcher = Dispatcher::new(registry, pool, Duration::from_secs(5));

    let items = vec![
        Ok(request("f1", "test-0.html", "r0")),
        Ok(request("f1", "test-1.html", "r1")),
        Ok(request("missing-fetcher", "whatever", "r2")),
    ];
    let inbound = stream::iter(items);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(8);

    run_stream(dispatcher, StreamConfig { in_flight_capacity: 2 }, inbound, outbound_tx)
        .await
        .unwrap();

    let mut replies = Vec::new();
    while let Some(reply) = outbound_rx.recv().await {
        replies.push(reply);
    }
    assert_eq!(replies.len(), 3);
    assert_eq!(replies.iter().filter(|r| r.status == ReplyStatus::ParseSuccess).count(), 2);
    assert_eq!(replies.iter().filter(|r| r.status == ReplyStatus::FetchException).count(), 1);
}

#[tokio::test]
async fn worker_crash_is_recovered_without_affecting_other_requests() {
    let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
    registry.save("f1", "FileSystemFetcher", "{}").unwrap();
    let spawner = Arc::new(ScriptedSpawner {
        script: Arc::new(|key| if key == "__crash__" { Script::Crash } else { Script::Echo }),
        spawn_count: AtomicU32::new(0),
    });
    let pool = WorkerPool::new(2, spawner, WorkerConfig::default());
    let dispatcher = Dispatcher::new(registry, pool, Duration::from_secs(5));

    let items: Vec<_> = (0..6)
        .map(|i| {
            let key = if i % 3 == 0 { "__crash__".to_string() } else { format!("key-{i}") };
            Ok(request("f1", &key, &i.to_string()))
        })
        .collect();
    let inbound = stream::iter(items);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(8);

    run_stream(dispatcher, StreamConfig { in_flight_capacity: 2 }, inbound, outbound_tx)
        .await
        .unwrap();

    let mut replies = Vec::new();
    while let Some(reply) = outbound_rx.recv().await {
        replies.push(reply);
    }
    assert_eq!(replies.len(), 6);

    let crashed: Vec<_> = replies.iter().filter(|r| r.fetch_key == "__crash__").collect();
    assert_eq!(crashed.len(), 2);
    assert!(crashed.iter().all(|r| r.status == ReplyStatus::ClientUnavailable));

    let ok: Vec<_> = replies.iter().filter(|r| r.fetch_key != "__crash__").collect();
    assert_eq!(ok.len(), 4);
    assert!(ok.iter().all(|r| r.status == ReplyStatus::ParseSuccess));
}

#[tokio::test]
async fn slow_worker_times_out_and_is_usable_again_for_the_next_request() {
    let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
    registry.save("f1", "FileSystemFetcher", "{}").unwrap();
    let spawner = Arc::new(ScriptedSpawner {
        script: Arc::new(|key| {
            if key == "__stall__" {
                Script::Stall(Duration::from_secs(5))
            } else {
                Script::Echo
            }
        }),
        spawn_count: AtomicU32::new(0),
    });
    let pool = WorkerPool::new(1, spawner, WorkerConfig::default());
    let dispatcher = Dispatcher::new(registry, pool, Duration::from_millis(500));

    let started = tokio::time::Instant::now();
    let reply = dispatcher
        .dispatch(request("f1", "__stall__", "r1"), None, never_cancelled())
        .await;
    assert_eq!(reply.status, ReplyStatus::Timeout);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "timeout must fire near the 500ms ceiling, not the 5s stall"
    );

    let reply = dispatcher
        .dispatch(request("f1", "fast.html", "r2"), None, never_cancelled())
        .await;
    assert_eq!(reply.status, ReplyStatus::ParseSuccess, "worker must be usable again after a timeout");
}

#[tokio::test]
async fn backpressure_bounds_concurrency_but_every_reply_still_arrives() {
    let registry = FetcherRegistry::spawn(RegistryConfig::default(), None);
    registry.save("f1", "FileSystemFetcher", "{}").unwrap();
    let pool = WorkerPool::new(2, echo_spawner(), WorkerConfig::default());
    let dispatcher = Dispatcher::new(registry, pool, Duration::from_secs(5));

    let items: Vec<_> = (0..100)
        .map(|i| Ok(request("f1", &format!("k{i}"), &i.to_string())))
        .collect();
    let inbound = stream::iter(items);
    // A small outbound buffer relative to the 100 requests forces the
    // sender task to apply backpressure back through the in-flight
    // semaphore while the stream is still being drained.
    let (outbound_tx, mut outbound_rx) = mpsc::channel(4);

    let handle = tokio::spawn(run_stream(
        dispatcher,
        StreamConfig { in_flight_capacity: 2 },
        inbound,
        outbound_tx,
    ));

    let mut count = 0;
    while outbound_rx.recv().await.is_some() {
        count += 1;
    }
    assert_eq!(count, 100, "every request must eventually get exactly one reply");
    handle.await.unwrap().unwrap();
}
