//! The worker-to-child wire protocol: each direction carries
//! length-prefixed JSON frames — a 4-byte big-endian length followed by
//! UTF-8 JSON bytes. A Content-Length-framed JSON-RPC transport, simplified
//! to the single-request/single-reply shape this protocol actually needs.

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected rather than trusted blindly off
/// the wire; a well-behaved child never approaches it.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error talking to child: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("child closed its stdout (end-of-stream treated as a crash)")]
    Eof,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge(u32),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildRequestFrame {
    pub fetcher_config: ChildFetcherConfig,
    pub fetch_key: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildFetcherConfig {
    pub fetcher_id: String,
    pub plugin_id: String,
    pub config_json: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildReplyFrame {
    pub status: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub error_message: String,
}

pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(payload)?;
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
        Err(e) => return Err(e.into()),
    };
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}
