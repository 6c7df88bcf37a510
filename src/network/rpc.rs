//! Wire messages for forwarding submissions between members.
//!
//! Frames are a big-endian `u32` length followed by a bincode-encoded
//! [`PeerMessage`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, NetworkError, Result};
use crate::packer::PackReceipt;
use crate::types::{Entry, Prefix};

/// Messages exchanged between members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Append `entry` to `prefix` on the receiving member.
    Submit {
        request_id: u64,
        prefix: Prefix,
        entry: Entry,
        /// Caller's remaining budget, so the owner stops waiting too.
        timeout_ms: Option<u64>,
    },

    SubmitResult {
        request_id: u64,
        result: std::result::Result<PackReceipt, RemoteError>,
    },

    Ping { request_id: u64 },

    Pong { request_id: u64, node_name: String },
}

impl PeerMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            PeerMessage::Submit { request_id, .. }
            | PeerMessage::SubmitResult { request_id, .. }
            | PeerMessage::Ping { request_id }
            | PeerMessage::Pong { request_id, .. } => *request_id,
        }
    }
}

/// An error as relayed over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Remote {
            kind: e.kind,
            message: e.message,
        }
    }
}

pub fn encode_message(msg: &PeerMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode_message(data: &[u8]) -> Result<PeerMessage> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a message with its length prefix.
pub fn frame_message(msg: &PeerMessage, max_frame: usize) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    if data.len() > max_frame {
        return Err(NetworkError::FrameTooLarge {
            size: data.len(),
            max: max_frame,
        }
        .into());
    }
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

pub async fn write_frame<W>(writer: &mut W, msg: &PeerMessage, max_frame: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg, max_frame)?;
    writer.write_all(&framed).await.map_err(NetworkError::from)?;
    writer.flush().await.map_err(NetworkError::from)?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<PeerMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::from(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: max_frame,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::from)?;
    decode_message(&data).map(Some)
}
