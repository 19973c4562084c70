//! DatagramPipe - in-memory, message-preserving `AsyncRead`/`AsyncWrite` pair
//!
//! Each `poll_write` enqueues one datagram and each `poll_read` returns one,
//! truncated to the caller's buffer like a UDP socket would. An empty
//! datagram reads as zero bytes, so a dropped peer is reported as
//! `BrokenPipe` rather than EOF. The two ends of a [`DatagramPipe::pair`]
//! are cross-wired, so what one writes the other reads.
//!
//! # Usage
//!
//! ```
//! use tun_intercept::stack::DatagramPipe;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! let (mut client, mut server) = DatagramPipe::pair(16);
//! client.write_all(b"query").await?;
//!
//! let mut buf = [0u8; 64];
//! let n = server.read(&mut buf).await?;
//! assert_eq!(&buf[..n], b"query");
//! # Ok(())
//! # }
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// One end of an in-memory datagram link
pub struct DatagramPipe {
    /// Datagrams written by the other end
    rx: mpsc::Receiver<Bytes>,
    /// Datagrams for the other end (wrapped for polling)
    tx: PollSender<Bytes>,
}

impl DatagramPipe {
    /// Wrap existing channels
    pub fn new(rx: mpsc::Receiver<Bytes>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            rx,
            tx: PollSender::new(tx),
        }
    }

    /// Two cross-wired ends, each buffering up to `capacity` datagrams
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Self::new(a_rx, b_tx), Self::new(b_rx, a_tx))
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "datagram pipe closed")
}

impl AsyncRead for DatagramPipe {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                // excess bytes are discarded, as with a UDP socket
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for DatagramPipe {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => match this.tx.send_item(Bytes::copy_from_slice(buf)) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(_) => Poll::Ready(Err(closed())),
            },
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
