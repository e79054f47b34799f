//! Wire frames shared by the relay and its clients.
//!
//! Every frame is msgpack (`rmp-serde`) behind a u32 little-endian length
//! prefix.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::presence::{AwarenessMessage, ClientId};

/// Upper bound on one frame's payload
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame from a client: which session (room) to join
    Hello { session: String },
    /// Relay reply to `Hello` with the connection's transient id
    Welcome { client_id: ClientId },
    /// One automerge sync protocol message
    Sync(Vec<u8>),
    Awareness(AwarenessMessage),
}

/// Send a frame with length prefix
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let data = rmp_serde::to_vec(frame)?;
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", data.len());
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a frame. Not cancel-safe: a partially read frame is lost if the
/// future is dropped, so callers read from a dedicated task.
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        bail!("incoming frame of {len} bytes exceeds limit");
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    Ok(rmp_serde::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceRecord, PresenceState, UserInfo};

    fn encoded(frame: &Frame) -> Vec<u8> {
        let data = rmp_serde::to_vec(frame).unwrap();
        let mut out = (data.len() as u32).to_le_bytes().to_vec();
        out.extend(data);
        out
    }

    #[tokio::test]
    async fn frames_are_length_prefixed() {
        let frame = Frame::Hello {
            session: "canvas-1".into(),
        };
        let mut mock = tokio_test::io::Builder::new().write(&encoded(&frame)).build();
        send_frame(&mut mock, &frame).await.unwrap();
    }

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let awareness = Frame::Awareness(AwarenessMessage::Update(PresenceRecord {
            client_id: ClientId(4),
            state: PresenceState::new(UserInfo::new("u4", "Dee", "dee@example.com")),
        }));
        let sync = Frame::Sync(vec![1, 2, 3]);
        let mut mock = tokio_test::io::Builder::new()
            .read(&encoded(&awareness))
            .read(&encoded(&sync))
            .build();
        assert_eq!(recv_frame(&mut mock).await.unwrap(), awareness);
        assert_eq!(recv_frame(&mut mock).await.unwrap(), sync);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        let mut mock = tokio_test::io::Builder::new().read(&len).build();
        assert!(recv_frame(&mut mock).await.is_err());
    }

    #[tokio::test]
    async fn eof_is_an_error() {
        let mut empty: &[u8] = &[];
        assert!(recv_frame(&mut empty).await.is_err());
    }
}
