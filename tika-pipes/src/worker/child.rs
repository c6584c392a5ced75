//! The boundary between a `Worker` and its actual OS subprocess. Kept as
//! a trait so the worker state machine (restart/backoff, timeout, crash
//! classification) can be exercised in tests without spawning a real
//! process.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::warn;

use super::protocol::{read_frame, write_frame, ChildReplyFrame, ChildRequestFrame, FrameError};

#[async_trait]
pub trait ChildHandle: Send {
    async fn send_request(&mut self, request: &ChildRequestFrame) -> Result<(), FrameError>;
    async fn read_reply(&mut self) -> Result<ChildReplyFrame, FrameError>;
    /// SIGTERM, waiting up to `grace` before the caller should escalate.
    async fn terminate(&mut self, grace: Duration);
    /// SIGKILL, for a child that ignored `terminate`.
    async fn kill(&mut self);
    /// Non-blocking check for whether the subprocess has already exited on
    /// its own, used to detect a crash between requests.
    async fn has_exited(&mut self) -> bool;
}

#[async_trait]
pub trait ChildSpawner: Send + Sync {
    async fn spawn(&self) -> io::Result<Box<dyn ChildHandle>>;
}

/// Spawns the configured parse binary and speaks the length-prefixed JSON
/// protocol over its stdio.
pub struct ProcessSpawner {
    pub program: String,
    pub args: Vec<String>,
}

#[async_trait]
impl ChildSpawner for ProcessSpawner {
    async fn spawn(&self) -> io::Result<Box<dyn ChildHandle>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child spawned without stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child spawned without stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        Ok(Box::new(ProcessChild {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        }))
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    use tokio::io::AsyncBufReadExt;
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "tika_pipes::worker::child", "{line}");
    }
}

struct ProcessChild {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[async_trait]
impl ChildHandle for ProcessChild {
    async fn send_request(&mut self, request: &ChildRequestFrame) -> Result<(), FrameError> {
        write_frame(&mut self.stdin, request).await
    }

    async fn read_reply(&mut self) -> Result<ChildReplyFrame, FrameError> {
        read_frame(&mut self.stdout).await
    }

    async fn terminate(&mut self, grace: Duration) {
        if let Some(id) = self.child.id() {
            // tokio's `Child::kill` always sends SIGKILL; send SIGTERM
            // ourselves so a well-behaved parser gets a chance to flush
            // partial output before we escalate.
            // SAFETY: `id` is the live child's pid for the duration of this call.
            let result = unsafe { libc::kill(id as libc::c_int, libc::SIGTERM) };
            if result != 0 {
                warn!("SIGTERM to child {id} failed: {}", io::Error::last_os_error());
            }
        }
        let _ = tokio::time::timeout(grace, self.child.wait()).await;
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }

    async fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}
