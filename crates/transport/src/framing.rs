//! Length-prefixed framing for byte-stream transports.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Largest frame accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one frame from `reader`.
///
/// A clean end of stream before the length prefix is reported as
/// [`TransportError::ConnectionClosed`]. A length above `max_frame_size` is
/// reported as [`TransportError::FrameTooLarge`]; the stream cannot be resynced
/// after that.
///
/// # Errors
///
/// Returns an error if the stream fails or the frame is too large.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed);
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size: len,
            limit: max_frame_size,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    Ok(Bytes::from(data))
}

/// Write one frame to `writer` and flush it.
///
/// # Errors
///
/// Returns an error if the frame is too large or the stream fails.
pub async fn write_frame<W>(
    writer: &mut W,
    data: &[u8],
    max_frame_size: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            limit: max_frame_size,
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);

        let writer = tokio::spawn(async move {
            write_frame(&mut client, b"first frame", DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            write_frame(&mut client, b"", DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            write_frame(&mut client, b"third", DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
        });

        assert_eq!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap(),
            Bytes::from_static(b"first frame")
        );
        assert!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap(),
            Bytes::from_static(b"third")
        );

        writer.await.unwrap();
        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&1024u32.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FrameTooLarge {
                size: 1024,
                limit: 16
            }
        ));

        let err = write_frame(&mut client, &[0u8; 32], 16).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }
}
