// SPDX-License-Identifier: MIT

use anyhow::{bail, Result};
use concord_core::Envelope;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Frames larger than this are treated as corruption, not data.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

pub async fn write_frame(stream: &mut TcpStream, envelope: &Envelope) -> Result<()> {
    let bytes = bincode::serialize(envelope)?;
    if bytes.len() > MAX_FRAME_SIZE as usize {
        bail!("frame too large: {} bytes", bytes.len());
    }
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes", len);
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}
