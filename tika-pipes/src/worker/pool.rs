//! A pool of up to `N` workers, lazily started, handed out in FIFO order,
//! recycled on crash.
//!
//! Fairness and backpressure both fall out of a single `tokio::Semaphore`:
//! each permit represents one worker "slot" among the pool's `N`. A
//! `Borrow` that can't get a permit queues in FIFO order for free: that's
//! the semaphore's own wake order. A returned worker is pushed onto the
//! idle queue *before* its permit is released, so a waiter that wakes on
//! that release always finds the just-returned worker waiting rather than
//! racing a fresh spawn past the capacity bound.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::{ChildSpawner, Worker, WorkerConfig, WorkerState};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("borrow was cancelled")]
    Cancelled,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Worker>>,
    spawner: Arc<dyn ChildSpawner>,
    worker_config: WorkerConfig,
    next_id: AtomicUsize,
    outstanding: AtomicUsize,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Spawns the pool's background idle-liveness sweeper alongside the
    /// returned handle. The sweeper periodically checks every resting
    /// worker's subprocess for an out-of-band exit and respawns it before
    /// it's ever handed out, so a crash that happens between requests is
    /// never mistaken for one that happened during a request.
    pub fn new(size: usize, spawner: Arc<dyn ChildSpawner>, worker_config: WorkerConfig) -> Self {
        let inner = Arc::new(Inner {
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(VecDeque::new()),
            spawner,
            worker_config,
            next_id: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        });

        let sweep_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_inner.worker_config.idle_liveness_check_interval).await;
                let mut idle = sweep_inner.idle.lock().await;
                for worker in idle.iter_mut() {
                    worker.check_idle_liveness().await;
                }
            }
        });

        Self { inner }
    }

    pub fn busy_count(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// `Borrow(ctx)`: blocks (honoring FIFO order) until a worker is
    /// available or `cancel` resolves first.
    pub async fn borrow(&self, cancel: impl Future<Output = ()>) -> Result<PooledWorker, PoolError> {
        let semaphore = self.inner.semaphore.clone();
        let permit = tokio::select! {
            biased;
            res = semaphore.acquire_owned() => res.map_err(|_| PoolError::ShuttingDown)?,
            () = cancel => return Err(PoolError::Cancelled),
        };

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        let existing = {
            let mut idle = self.inner.idle.lock().await;
            idle.pop_front()
        };
        let worker = match existing {
            Some(w) => w,
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                Worker::new(id, self.inner.spawner.clone(), self.inner.worker_config)
            }
        };

        record_gauges(&self.inner);
        record_idle_gauge(&self.inner).await;
        Ok(PooledWorker {
            worker: Some(worker),
            pool: Some(self.inner.clone()),
            permit: Some(permit),
        })
    }

    /// Drains idle workers, closes the pool to new/waiting borrows
    /// (`UNAVAILABLE`), then waits up to `grace` for checked-out workers
    /// to come back before proceeding regardless.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut idle = self.inner.idle.lock().await;
            for mut worker in idle.drain(..) {
                worker.shutdown().await;
            }
        }
        self.inner.semaphore.close();

        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.outstanding.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.inner.outstanding.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "worker pool shutdown proceeding with checked-out workers still outstanding");
        }
    }
}

fn record_gauges(inner: &Arc<Inner>) {
    metrics::gauge!("tika_pipes_worker_pool_busy").set(inner.outstanding.load(Ordering::Relaxed) as f64);
}

/// `Worker::run_once` never returns leaving a worker `Restarting` (it
/// resolves to `Idle` or `Dead` before handing back control), so the idle
/// queue only ever holds idle or dead workers; a pool-level "restarting"
/// gauge would always read zero and isn't recorded.
async fn record_idle_gauge(inner: &Arc<Inner>) {
    let idle = inner.idle.lock().await;
    metrics::gauge!("tika_pipes_worker_pool_idle").set(idle.len() as f64);
}

/// RAII handle on a borrowed worker. Explicit [`PooledWorker::release`] is
/// the expected path; `Drop` is a safety net that still returns the
/// worker (via a spawned task, since returning is async) if a caller
/// forgets or panics before releasing.
pub struct PooledWorker {
    worker: Option<Worker>,
    pool: Option<Arc<Inner>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledWorker {
    pub fn worker_mut(&mut self) -> &mut Worker {
        self.worker.as_mut().expect("worker taken before release")
    }

    /// `Return(worker)`: discard if `DEAD`, otherwise make idle again.
    pub async fn release(mut self) {
        let worker = self.worker.take().expect("release called twice");
        let pool = self.pool.take().expect("release called twice");
        let permit = self.permit.take().expect("release called twice");
        return_worker(pool, worker, permit).await;
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let (Some(worker), Some(pool), Some(permit)) =
            (self.worker.take(), self.pool.take(), self.permit.take())
        {
            tokio::spawn(async move {
                return_worker(pool, worker, permit).await;
            });
        }
    }
}

async fn return_worker(pool: Arc<Inner>, worker: Worker, permit: OwnedSemaphorePermit) {
    pool.outstanding.fetch_sub(1, Ordering::SeqCst);
    if worker.state() == WorkerState::Dead {
        drop(permit);
        record_gauges(&pool);
        return;
    }
    {
        let mut idle = pool.idle.lock().await;
        idle.push_back(worker);
    }
    drop(permit);
    record_gauges(&pool);
    record_idle_gauge(&pool).await;
}
