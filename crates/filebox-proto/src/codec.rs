//! Newline-delimited JSON framing.
//!
//! Each frame is one JSON document followed by `\n`. Byte payloads inside
//! frames are base64 encoded, which keeps every frame free of raw newlines.

use crate::error::{FsError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize `frame` and write it as one line.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    if line.len() > MAX_FRAME_LEN {
        return Err(FsError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            line.len()
        )));
    }
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame, or `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if n > MAX_FRAME_LEN {
                return Err(FsError::Protocol("frame exceeds limit".to_string()));
            }
            // Peer went away mid-frame.
            return Err(FsError::Disconnected);
        }
        line.pop();
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        return Ok(Some(serde_json::from_slice(&line)?));
    }
}

/// Serde adapter storing `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
