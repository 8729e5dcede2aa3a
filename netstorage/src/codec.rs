//! Length-prefix framing over a buffered storage node connection.
//!
//! Three on-wire primitives, all little-endian:
//!
//! - bytes frame: `u64` length followed by that many payload bytes
//! - `u32` / `u64`: raw fixed-width integers
//!
//! Every read and write observes the deadline carried by the connection;
//! an expired deadline surfaces as [`RpcError::TimedOut`] at the next I/O,
//! exactly like any other transport failure.

use data_types::{BlockError, Deadline};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// The maximum size of an in-band error message frame.
pub(crate) const MAX_ERROR_MESSAGE_SIZE: u64 = 64 * 1024;

/// The maximum size of a label or label value frame.
pub(crate) const MAX_LABEL_SIZE: u64 = 16 * 1024 * 1024;

/// The maximum size of a serialized metric block frame.
pub(crate) const MAX_METRIC_BLOCK_SIZE: u64 = 1024 * 1024;

/// Errors from a single connection interaction.
///
/// [`RpcError::Remote`] is the only kind that leaves the connection
/// usable; everything else means the stream state is unknown and the
/// connection must be dropped.
#[derive(Debug, Error)]
pub enum RpcError {
    /// An in-band error message returned by the storage node. The
    /// protocol is intact and the request is reproducible.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// The connection deadline expired mid-I/O.
    #[error("timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    /// The peer announced a frame larger than the caller allows.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u64, max: u64 },

    /// The peer rejected or garbled the connection handshake.
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    /// A frame decoded into an invalid metric block.
    #[error("cannot unmarshal metric block: {0}")]
    Block(#[from] BlockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether this error was reported in-band by the peer, leaving the
    /// connection reusable.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Runs `fut` under the absolute deadline, if one is set.
pub(crate) async fn with_deadline<T>(
    deadline: Option<Deadline>,
    fut: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    match deadline {
        Some(deadline) => {
            let at = tokio::time::Instant::from_std(deadline.instant());
            match tokio::time::timeout_at(at, fut).await {
                Ok(res) => res,
                Err(_) => Err(RpcError::TimedOut {
                    timeout: deadline.timeout(),
                }),
            }
        }
        None => fut.await,
    }
}

/// A buffered TCP connection to a storage node.
///
/// Callers set the deadline immediately after borrowing the connection
/// from the pool; it applies to every subsequent frame operation.
#[derive(Debug)]
pub struct BufferedConn {
    stream: BufStream<TcpStream>,
    deadline: Option<Deadline>,
}

impl BufferedConn {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
            deadline: None,
        }
    }

    pub(crate) fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = Some(deadline);
    }

    /// Writes a length-prefixed bytes frame.
    pub(crate) async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            stream.write_u64_le(buf.len() as u64).await?;
            stream.write_all(buf).await?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn write_u32(&mut self, n: u32) -> Result<(), RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            stream.write_u32_le(n).await?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn write_u64(&mut self, n: u64) -> Result<(), RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            stream.write_u64_le(n).await?;
            Ok(())
        })
        .await
    }

    /// Flushes buffered writes to the socket.
    pub(crate) async fn flush(&mut self) -> Result<(), RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// Reads a length-prefixed bytes frame of at most `max_size` bytes.
    ///
    /// A zero-length frame is the end-of-stream marker for list replies
    /// and decodes to an empty buffer.
    pub(crate) async fn read_bytes(&mut self, max_size: u64) -> Result<Vec<u8>, RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            let size = stream.read_u64_le().await?;
            if size > max_size {
                return Err(RpcError::FrameTooLarge {
                    size,
                    max: max_size,
                });
            }
            let mut buf = vec![0u8; size as usize];
            stream.read_exact(&mut buf).await?;
            Ok(buf)
        })
        .await
    }

    pub(crate) async fn read_u32(&mut self) -> Result<u32, RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            Ok(stream.read_u32_le().await?)
        })
        .await
    }

    pub(crate) async fn read_u64(&mut self) -> Result<u64, RpcError> {
        let stream = &mut self.stream;
        with_deadline(self.deadline, async move {
            Ok(stream.read_u64_le().await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    async fn pair() -> (BufferedConn, BufferedConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (
            BufferedConn::new(client.unwrap()),
            BufferedConn::new(server.unwrap().0),
        )
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut client, mut server) = pair().await;

        client.write_bytes(b"hello").await.unwrap();
        client.write_u32(7).await.unwrap();
        client.write_u64(u64::MAX).await.unwrap();
        client.write_bytes(b"").await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(server.read_bytes(MAX_LABEL_SIZE).await.unwrap(), b"hello");
        assert_eq!(server.read_u32().await.unwrap(), 7);
        assert_eq!(server.read_u64().await.unwrap(), u64::MAX);
        // Zero-length frame decodes to an empty buffer.
        assert!(server.read_bytes(MAX_LABEL_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = pair().await;

        client.write_bytes(&[0u8; 100]).await.unwrap();
        client.flush().await.unwrap();

        assert_matches!(
            server.read_bytes(10).await,
            Err(RpcError::FrameTooLarge { size: 100, max: 10 })
        );
    }

    #[tokio::test]
    async fn expired_deadline_fails_the_next_read() {
        let (mut client, _server) = pair().await;
        client.set_deadline(Deadline::new(Duration::ZERO));

        // Nothing will ever arrive; the expired deadline trips instead.
        assert_matches!(
            client.read_bytes(MAX_ERROR_MESSAGE_SIZE).await,
            Err(RpcError::TimedOut { .. })
        );
    }
}
