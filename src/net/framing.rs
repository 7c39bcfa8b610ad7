//! Length-prefixed frames over a byte stream
//!
//! Format: [4 bytes little-endian length][JSON payload]

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors that can occur while reading or writing frames
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn closed_on_eof(e: io::Error) -> FramingError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(e)
    }
}

/// Read one frame, rejecting payloads above `max_len` before allocating
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(closed_on_eof)?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FramingError::FrameTooLarge(len, max_len));
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    Ok(buf)
}

/// Write one frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
    max_len: usize,
) -> Result<(), FramingError> {
    if data.len() > max_len {
        return Err(FramingError::FrameTooLarge(data.len(), max_len));
    }

    stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = 512;

    #[tokio::test]
    async fn test_read_write_frame() {
        let data = br#"{"action":"roll"}"#;
        let mut buffer = Vec::new();
        write_frame(&mut buffer, data, MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_frame(&mut cursor, MAX).await.unwrap();
        assert_eq!(result, data);
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"", MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        assert!(read_frame(&mut cursor, MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_too_large() {
        let mut buffer = Vec::new();
        let result = write_frame(&mut buffer, &vec![0u8; MAX + 1], MAX).await;
        assert!(matches!(result, Err(FramingError::FrameTooLarge(513, 512))));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_prefix() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(u32::MAX).to_le_bytes());

        let mut cursor = Cursor::new(buffer);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::FrameTooLarge(_, 512))));
    }

    #[tokio::test]
    async fn test_read_truncated_length() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_multiple_frames() {
        let frames = [b"first".to_vec(), b"second".to_vec(), b"third one".to_vec()];
        let mut buffer = Vec::new();
        for frame in &frames {
            write_frame(&mut buffer, frame, MAX).await.unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for expected in &frames {
            assert_eq!(&read_frame(&mut cursor, MAX).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_read_across_partial_chunks() {
        let payload = br#"{"action":"hold"}"#;
        let len = (payload.len() as u32).to_le_bytes();
        let mut stream = tokio_test::io::Builder::new()
            .read(&len[..2])
            .read(&len[2..])
            .read(&payload[..5])
            .read(&payload[5..])
            .build();

        assert_eq!(read_frame(&mut stream, MAX).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_write_error_surfaces_as_io() {
        let mut stream = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let result = write_frame(&mut stream, b"data", MAX).await;
        assert!(matches!(result, Err(FramingError::Io(_))));
    }
}
