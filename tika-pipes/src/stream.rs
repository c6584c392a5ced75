//! Bidirectional stream coordinator — bridges an inbound request stream
//! and an outbound reply stream, fanning work across dispatchers while
//! bounding how many requests are in flight at once.
//!
//! Three cooperating roles, kept deliberately separate rather than
//! collapsed into one event loop:
//! - the receiver loop below, which accepts inbound requests and spawns
//!   one dispatch task per request, gated by an in-flight semaphore
//!   (spawned tasks rather than a literal pool-of-dispatchers pulling off
//!   a queue — concurrency is still capped at `W` by the semaphore, and
//!   reply order is unconstrained either way, so the two are
//!   behaviorally equivalent here);
//! - those dispatch tasks themselves, each running one dispatch to
//!   completion;
//! - the sender task, which is the sole place that decides the stream
//!   has ended.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::domain::{FetchReply, FetchRequest};

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// `W`: capacity of the in-flight set, default pool size × 1.
    pub in_flight_capacity: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("inbound stream error: {0}")]
    Inbound(String),
    #[error("outbound stream error: {0}")]
    Outbound(String),
}

/// Runs one bidi call to completion. `inbound` yields domain requests (or
/// a transport-level error string); `outbound` is the channel the gRPC
/// layer turns into the wire reply stream. Returns `Ok(())` on a clean
/// half-close-then-drain, `Err` on a transport-level failure in either
/// direction.
pub async fn run_stream(
    dispatcher: Dispatcher,
    config: StreamConfig,
    mut inbound: impl Stream<Item = Result<FetchRequest, String>> + Unpin + Send + 'static,
    outbound: mpsc::Sender<FetchReply>,
) -> Result<(), StreamError> {
    let capacity = config.in_flight_capacity.max(1);
    let semaphore = Arc::new(Semaphore::new(capacity));
    let (reply_tx, mut reply_rx) = mpsc::channel::<FetchReply>(capacity);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let sender_cancel_tx = cancel_tx.clone();
    let sender = tokio::spawn(async move {
        let mut error = None;
        while let Some(reply) = reply_rx.recv().await {
            if outbound.send(reply).await.is_err() {
                error = Some(StreamError::Outbound("outbound receiver dropped".into()));
                let _ = sender_cancel_tx.send(true);
                break;
            }
        }
        error
    });

    let mut inbound_error = None;
    loop {
        match inbound.next().await {
            None => break,
            Some(Err(e)) => {
                warn!(error = %e, "inbound stream failed, cancelling in-flight dispatchers");
                inbound_error = Some(StreamError::Inbound(e));
                let _ = cancel_tx.send(true);
                break;
            }
            Some(Ok(request)) => {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                if *cancel_tx.borrow() {
                    drop(permit);
                    break;
                }

                metrics::gauge!("tika_pipes_stream_in_flight").set((capacity - semaphore.available_permits()) as f64);

                let dispatcher = dispatcher.clone();
                let reply_tx = reply_tx.clone();
                let cancel_rx = cancel_rx.clone();
                let semaphore_for_gauge = semaphore.clone();
                tokio::spawn(async move {
                    let reply = dispatcher.dispatch(request, None, cancel_rx).await;
                    drop(permit);
                    metrics::gauge!("tika_pipes_stream_in_flight")
                        .set((capacity - semaphore_for_gauge.available_permits()) as f64);
                    let _ = reply_tx.send(reply).await;
                });
            }
        }
    }
    drop(reply_tx);

    let outbound_error = sender.await.unwrap_or(None);

    if let Some(e) = inbound_error {
        return Err(e);
    }
    if let Some(e) = outbound_error {
        return Err(e);
    }
    Ok(())
}
