//! Framed message transport.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON-encoded
//! [`Message`]. Reads are wrapped in a timeout so one slow or hostile
//! peer cannot stall the single scheduler task past the guard interval,
//! and frames above the size limit are rejected before allocation.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::error::{WireError, WireResult};
use crate::messages::Message;

/// Largest frame we will read or write.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default guard timeout for in-frame reads and one-shot sends.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// A message-framed stream.
///
/// Generic over the transport so protocol logic can be exercised against
/// `tokio::io::duplex` pairs in tests.
pub struct FrameStream<S> {
    inner: S,
    read_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Set the guard timeout applied to each frame read.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> WireResult<()> {
        let payload = serde_json::to_vec(msg).map_err(|e| WireError::Encode(e.to_string()))?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(payload.len(), MAX_FRAME_BYTES));
        }
        self.inner.write_u32(payload.len() as u32).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        trace!(bytes = payload.len(), "frame sent");
        Ok(())
    }

    /// Receive one message.
    ///
    /// Returns `Ok(None)` on a clean close at a frame boundary. A close
    /// or timeout mid-frame is an error: the frame was truncated.
    pub async fn recv(&mut self) -> WireResult<Option<Message>> {
        let mut len_buf = [0u8; 4];
        match timeout(self.read_timeout, self.inner.read_exact(&mut len_buf)).await {
            Err(_) => return Err(WireError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(len, MAX_FRAME_BYTES));
        }

        let mut payload = vec![0u8; len];
        match timeout(self.read_timeout, self.inner.read_exact(&mut payload)).await {
            Err(_) => return Err(WireError::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let msg = serde_json::from_slice(&payload).map_err(|e| WireError::Decode(e.to_string()))?;
        trace!(bytes = len, "frame received");
        Ok(Some(msg))
    }

    /// Receive, treating a clean close as a protocol error.
    ///
    /// For mid-round reads where the peer owes us a frame.
    pub async fn expect(&mut self) -> WireResult<Message> {
        self.recv()
            .await?
            .ok_or_else(|| WireError::Decode("peer closed mid-round".to_string()))
    }

    /// Consume the stream, returning the transport.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Connect to a peer and wrap the stream, bounded by `io_timeout`.
pub async fn connect(addr: &str, io_timeout: Duration) -> WireResult<FrameStream<TcpStream>> {
    let stream = timeout(io_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| WireError::Timeout)??;
    Ok(FrameStream::new(stream).with_read_timeout(io_timeout))
}

/// Fire-and-forget: connect, send one message, close.
///
/// Used for relinquish, keep-alive, reschedule, and ad publication,
/// none of which expect a reply.
pub async fn send_oneshot(addr: &str, msg: &Message, io_timeout: Duration) -> WireResult<()> {
    let mut stream = connect(addr, io_timeout).await?;
    stream.send(msg).await?;
    let mut inner = stream.into_inner();
    inner.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ActivationReply;

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = FrameStream::new(a);
        let mut rx = FrameStream::new(b);

        tx.send(&Message::SendJobInfo).await.unwrap();
        tx.send(&Message::Activation {
            reply: ActivationReply::TryAgain,
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), Some(Message::SendJobInfo));
        assert_eq!(
            rx.recv().await.unwrap(),
            Some(Message::Activation {
                reply: ActivationReply::TryAgain
            })
        );
    }

    #[tokio::test]
    async fn clean_close_is_none() {
        let (a, b) = tokio::io::duplex(4096);
        drop(a);
        let mut rx = FrameStream::new(b);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_mid_round_is_error_via_expect() {
        let (a, b) = tokio::io::duplex(4096);
        drop(a);
        let mut rx = FrameStream::new(b);
        assert!(rx.expect().await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_u32(&mut a, (MAX_FRAME_BYTES + 1) as u32)
            .await
            .unwrap();
        let mut rx = FrameStream::new(b);
        assert!(matches!(
            rx.recv().await,
            Err(WireError::FrameTooLarge(_, _))
        ));
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let (_a, b) = tokio::io::duplex(4096);
        let mut rx = FrameStream::new(b).with_read_timeout(Duration::from_millis(20));
        assert!(matches!(rx.recv().await, Err(WireError::Timeout)));
    }

    #[tokio::test]
    async fn garbage_payload_is_decode_error() {
        let (mut a, b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_u32(&mut a, 4).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"????").await.unwrap();
        let mut rx = FrameStream::new(b);
        assert!(matches!(rx.recv().await, Err(WireError::Decode(_))));
    }
}
