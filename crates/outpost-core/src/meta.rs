//! Connection metadata sent to the client ahead of the proxied bytes.
//!
//! Encoded as a `u32` length prefix followed by JSON so either side can grow
//! the record without breaking the other.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the encoded record; anything bigger is a protocol error.
const MAX_META: usize = 4096;

/// First bytes a reverse stream carries once bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnMeta {
    /// Originating end-user IP as the edge saw it.
    pub ip: String,
}

pub async fn write_meta<W>(w: &mut W, meta: &ClientConnMeta) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(meta)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    w.write_u32(json.len() as u32).await?;
    w.write_all(&json).await?;
    w.flush().await?;

    Ok(())
}

pub async fn read_meta<R>(r: &mut R) -> std::io::Result<ClientConnMeta>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_META {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("connection metadata of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
