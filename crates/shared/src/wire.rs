//! Length-prefixed framing over the serial byte-stream.
//!
//! `[len: u32 big-endian][payload: len bytes]`, no padding, no alignment.
//! A length header over the configured limit is fatal to the session; the
//! reader must not allocate or retain any part of such a frame.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LEN_HEADER_BYTES: usize = 4;

/// Default ceiling for one frame, header excluded.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer or the device vanished, possibly mid-frame.
    #[error("channel disconnected")]
    Disconnected,
    /// Fatal framing violation; the session must be torn down.
    #[error("frame length {length} exceeds limit {limit}")]
    Oversize { length: u32, limit: u32 },
    #[error("channel i/o: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => WireError::Disconnected,
            _ => WireError::Io(err),
        }
    }
}

/// Read one complete frame, retrying short reads until the frame is whole.
///
/// A cut stream at any point yields [`WireError::Disconnected`]; no partial
/// payload escapes.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: u32) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_HEADER_BYTES];
    reader.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header);
    if length > max_frame_bytes {
        return Err(WireError::Oversize {
            length,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one complete frame. The caller serializes frame writes; this
/// function never interleaves with itself because only the session
/// write-loop invokes it.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    max_frame_bytes: u32,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len()).map_err(|_| WireError::Oversize {
        length: u32::MAX,
        limit: max_frame_bytes,
    })?;
    if length > max_frame_bytes {
        return Err(WireError::Oversize {
            length,
            limit: max_frame_bytes,
        });
    }

    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const LIMIT: u32 = 1024;

    #[tokio::test]
    async fn frame_round_trips() {
        let (mut host, mut guest) = tokio::io::duplex(4096);
        write_frame(&mut host, b"hello agent", LIMIT).await.unwrap();
        let frame = read_frame(&mut guest, LIMIT).await.unwrap();
        assert_eq!(frame, b"hello agent");
    }

    #[tokio::test]
    async fn empty_frame_is_valid() {
        let (mut host, mut guest) = tokio::io::duplex(64);
        write_frame(&mut host, b"", LIMIT).await.unwrap();
        assert_eq!(read_frame(&mut guest, LIMIT).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn byte_at_a_time_delivery_reassembles() {
        let (mut host, mut guest) = tokio::io::duplex(4096);
        let payload = b"chunked delivery".to_vec();

        let writer = tokio::spawn(async move {
            let mut wire = Vec::new();
            wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            wire.extend_from_slice(&payload);
            for byte in wire {
                host.write_all(&[byte]).await.unwrap();
                host.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            host
        });

        let frame = read_frame(&mut guest, LIMIT).await.unwrap();
        assert_eq!(frame, b"chunked delivery");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_header_is_a_protocol_error() {
        let (mut host, mut guest) = tokio::io::duplex(64);
        host.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
        match read_frame(&mut guest, LIMIT).await {
            Err(WireError::Oversize { length, limit }) => {
                assert_eq!(length, u32::MAX);
                assert_eq!(limit, LIMIT);
            }
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exact_limit_is_accepted() {
        let (mut host, mut guest) = tokio::io::duplex(8192);
        let payload = vec![7u8; LIMIT as usize];
        write_frame(&mut host, &payload, LIMIT).await.unwrap();
        assert_eq!(read_frame(&mut guest, LIMIT).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn cut_mid_header_reads_as_disconnect() {
        let (mut host, mut guest) = tokio::io::duplex(64);
        host.write_all(&[0x00, 0x00]).await.unwrap();
        drop(host);
        assert!(matches!(
            read_frame(&mut guest, LIMIT).await,
            Err(WireError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn cut_mid_payload_reads_as_disconnect() {
        let (mut host, mut guest) = tokio::io::duplex(64);
        host.write_all(&8u32.to_be_bytes()).await.unwrap();
        host.write_all(b"abc").await.unwrap();
        drop(host);
        assert!(matches!(
            read_frame(&mut guest, LIMIT).await,
            Err(WireError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn oversize_write_is_refused() {
        let (mut host, _guest) = tokio::io::duplex(64);
        let payload = vec![0u8; LIMIT as usize + 1];
        assert!(matches!(
            write_frame(&mut host, &payload, LIMIT).await,
            Err(WireError::Oversize { .. })
        ));
    }
}
