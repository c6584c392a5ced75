//! Worker — owns one long-lived parse subprocess, runs one fetch-and-parse
//! at a time, restarts itself on crash or timeout.

mod child;
pub mod pool;
pub mod protocol;

pub use child::{ChildHandle, ChildSpawner, ProcessSpawner};
pub use pool::{PoolError, PooledWorker, WorkerPool};

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::{FetchReply, FetchRequest, ReplyStatus};
use crate::registry::FetcherConfig;
use crate::worker::protocol::ChildFetcherConfig;

use self::protocol::{ChildRequestFrame, FrameError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Restarting,
    Dead,
}

/// Fixed grace bound between SIGTERM and SIGKILL, and between a fired
/// deadline and control returning to the caller.
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_restart_attempts: u32,
    pub restart_backoff_base: Duration,
    /// How often the pool's idle-liveness sweep checks a resting worker's
    /// subprocess for an out-of-band exit.
    pub idle_liveness_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_backoff_base: Duration::from_millis(100),
            idle_liveness_check_interval: Duration::from_secs(1),
        }
    }
}

pub struct Worker {
    id: usize,
    spawner: std::sync::Arc<dyn ChildSpawner>,
    config: WorkerConfig,
    child: Option<Box<dyn ChildHandle>>,
    state: WorkerState,
    restarts_performed: u64,
}

impl Worker {
    pub fn new(id: usize, spawner: std::sync::Arc<dyn ChildSpawner>, config: WorkerConfig) -> Self {
        Self {
            id,
            spawner,
            config,
            child: None,
            state: WorkerState::Idle,
            restarts_performed: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn restarts_performed(&self) -> u64 {
        self.restarts_performed
    }

    /// RunOnce(fetchReq, fetcherConfig, timeoutMillis) -> FetchReply.
    /// Returns within `timeout + KILL_GRACE`. Leaves `self.state()` as
    /// `Idle` or `Dead` — never `Busy`/`Restarting` once this returns.
    pub async fn run_once(
        &mut self,
        request: &FetchRequest,
        fetcher: &FetcherConfig,
        timeout: Duration,
    ) -> FetchReply {
        self.state = WorkerState::Busy;

        if self.child.is_none() && !self.respawn().await {
            self.state = WorkerState::Dead;
            return FetchReply::error(
                request,
                ReplyStatus::ClientUnavailable,
                "worker has no usable subprocess",
            );
        }

        let frame = ChildRequestFrame {
            fetcher_config: ChildFetcherConfig {
                fetcher_id: fetcher.fetcher_id.clone(),
                plugin_id: fetcher.plugin_id.clone(),
                config_json: fetcher.config_json.clone(),
            },
            fetch_key: request.fetch_key.clone(),
            metadata: request.metadata.clone(),
        };

        let child = self.child.as_mut().expect("just ensured present");
        if let Err(e) = child.send_request(&frame).await {
            warn!(worker = self.id, error = %e, "write to child failed, treating as crash");
            return self.handle_crash(request, ReplyStatus::ClientUnavailable).await;
        }

        match tokio::time::timeout(timeout, child.read_reply()).await {
            Ok(Ok(reply)) => {
                self.state = WorkerState::Idle;
                FetchReply {
                    fetch_key: request.fetch_key.clone(),
                    status: ReplyStatus::parse(&reply.status).unwrap_or(ReplyStatus::ParseException),
                    fields: reply.fields,
                    error_message: reply.error_message,
                    request_id: request.request_id.clone(),
                }
            }
            Ok(Err(FrameError::Eof)) | Ok(Err(_)) => {
                self.handle_crash(request, ReplyStatus::ClientUnavailable).await
            }
            Err(_elapsed) => {
                warn!(worker = self.id, fetch_key = %request.fetch_key, "request timed out");
                if let Some(child) = self.child.as_mut() {
                    child.terminate(KILL_GRACE).await;
                    child.kill().await;
                }
                self.child = None;
                self.state = WorkerState::Restarting;
                self.finish_restart().await;
                FetchReply::error(request, ReplyStatus::Timeout, "parse exceeded the request deadline")
            }
        }
    }

    async fn handle_crash(&mut self, request: &FetchRequest, status: ReplyStatus) -> FetchReply {
        self.child = None;
        self.state = WorkerState::Restarting;
        self.finish_restart().await;
        FetchReply::error(request, status, "worker subprocess became unavailable")
    }

    /// Drives RESTARTING -> IDLE or DEAD, logging either outcome.
    async fn finish_restart(&mut self) {
        if self.respawn().await {
            self.state = WorkerState::Idle;
        } else {
            self.state = WorkerState::Dead;
            warn!(worker = self.id, "worker exhausted restart attempts, marking dead");
        }
    }

    /// Exponential-backoff respawn, up to `maxRestartAttempts`.
    async fn respawn(&mut self) -> bool {
        for attempt in 0..self.config.max_restart_attempts {
            if attempt > 0 {
                let backoff = self.config.restart_backoff_base * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
            match self.spawner.spawn().await {
                Ok(child) => {
                    self.child = Some(child);
                    if attempt > 0 {
                        self.restarts_performed += 1;
                        info!(worker = self.id, attempt, "respawned parse subprocess");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(worker = self.id, attempt, error = %e, "respawn attempt failed");
                }
            }
        }
        false
    }

    /// Checked periodically while a worker sits idle in the pool. If its
    /// subprocess exited on its own (out-of-band crash or kill) with no
    /// request in flight, respawn it right away so the gap is never
    /// observed by a caller: the next `run_once` simply finds a fresh
    /// subprocess instead of treating this as a mid-request crash.
    pub async fn check_idle_liveness(&mut self) {
        if self.state != WorkerState::Idle {
            return;
        }
        let exited = match self.child.as_mut() {
            Some(child) => child.has_exited().await,
            None => true,
        };
        if !exited {
            return;
        }
        warn!(worker = self.id, "idle worker's subprocess exited, respawning");
        self.child = None;
        self.state = WorkerState::Restarting;
        self.finish_restart().await;
    }

    /// shutdown() -> DEAD: kill the child and drain.
    pub async fn shutdown(&mut self) {
        if let Some(child) = self.child.as_mut() {
            child.terminate(KILL_GRACE).await;
            child.kill().await;
        }
        self.child = None;
        self.state = WorkerState::Dead;
    }
}
