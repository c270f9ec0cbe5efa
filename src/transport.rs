//! NetBIOS Session Service framing for SMB2 over TCP.
//!
//! Each message is prefixed with a 4-byte big-endian length.
//! The top byte is the message type and must be 0x00 (session message).
//!
//! MS-SMB2 Section 2.1: Transport

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload the 24-bit length can describe.
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Read a single NetBIOS-framed SMB2 message from the stream.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;

    if len_buf[0] != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Unexpected NetBIOS message type {:#04x}", len_buf[0]),
        ));
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write a single NetBIOS-framed SMB2 message to the stream.
pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> std::io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Frame too large: {} bytes", data.len()),
        ));
    }
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}
