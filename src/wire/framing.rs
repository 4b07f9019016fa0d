//! Length-prefixed framing for the client link.
//!
//! Frame format: [4-byte length (u32 big-endian)][message bytes]
//! Maximum frame size: 64KB (the ledger's maximum payload size; larger
//! logical messages travel through the chunker)

use crate::wire::{WireError, WireResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Write one encoded message as a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> WireResult<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::FrameTooLarge {
            got: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Ok(None)` on clean EOF
/// (connection closed between frames).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> WireResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::FrameTooLarge {
            got: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let payload = vec![0xABu8; 300];

        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(result, payload);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_payload_not_written() {
        let mut buf = Vec::new();
        let payload = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(write_frame(&mut buf, &payload).await.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_two_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").await.unwrap();
        write_frame(&mut buf, b"second").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"second");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }
}
