//! Link endpoint: the TUN descriptor as an `AsyncRead + AsyncWrite` packet pipe
//!
//! This is the shape the embedded stack consumes. Every `poll_read` yields
//! exactly one IP packet and every `poll_write` emits exactly one.
//!
//! The descriptor is registered with the tokio reactor once, when the
//! endpoint is first built. Clones share that registration. Closing the
//! owning [`TunDevice`](super::TunDevice) cancels pending operations: reads
//! and writes then fail with `BrokenPipe`. A closed link never reads as
//! EOF, since the stack driver would keep polling it.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::fd::TunFd;
use super::sys;

struct LinkShared {
    io: Mutex<Option<Arc<AsyncFd<TunFd>>>>,
    name: String,
    mtu: u32,
    shutdown: CancellationToken,
}

/// Packet-level async adapter over a TUN descriptor
pub struct LinkEndpoint {
    shared: Arc<LinkShared>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl LinkEndpoint {
    /// Register `fd` with the current runtime's reactor
    ///
    /// # Errors
    ///
    /// Fails outside a tokio runtime or if the reactor rejects the descriptor.
    pub(crate) fn new(fd: TunFd, name: String, mtu: u32, shutdown: CancellationToken) -> io::Result<Self> {
        let io = AsyncFd::new(fd)?;
        let shared = Arc::new(LinkShared {
            io: Mutex::new(Some(Arc::new(io))),
            name,
            mtu,
            shutdown,
        });
        Ok(Self::from_shared(shared))
    }

    fn from_shared(shared: Arc<LinkShared>) -> Self {
        let cancelled = Box::pin(shared.shutdown.clone().cancelled_owned());
        Self { shared, cancelled }
    }

    /// MTU the stack should use on this link
    pub fn mtu(&self) -> u32 {
        self.shared.mtu
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether two handles wrap the same registration
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Whether the owning device has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    fn io(&self) -> Option<Arc<AsyncFd<TunFd>>> {
        if self.shared.shutdown.is_cancelled() {
            return None;
        }
        self.shared.io.lock().clone()
    }

    /// Non-blocking single-packet read, bypassing the reactor
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let io = self.io().ok_or_else(closed)?;
        sys::read_packet(io.get_ref(), buf)
    }

    /// Non-blocking single-packet write, bypassing the reactor
    pub(crate) fn try_write(&self, packet: &[u8]) -> io::Result<usize> {
        let io = self.io().ok_or_else(closed)?;
        sys::write_packet(io.get_ref(), packet)
    }

    /// Drop this link's reference to the descriptor
    ///
    /// The descriptor closes once in-flight operations holding a clone of
    /// the registration return.
    pub(crate) fn release(&self) {
        drop(self.shared.io.lock().take());
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "TUN device closed")
}

impl Clone for LinkEndpoint {
    fn clone(&self) -> Self {
        Self::from_shared(Arc::clone(&self.shared))
    }
}

impl fmt::Debug for LinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEndpoint")
            .field("name", &self.shared.name)
            .field("mtu", &self.shared.mtu)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for LinkEndpoint {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(closed()));
        }
        let Some(io) = this.io() else {
            return Poll::Ready(Err(closed()));
        };

        loop {
            let mut guard = ready!(io.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| sys::read_packet(inner.get_ref(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for LinkEndpoint {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, packet: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(closed()));
        }
        let Some(io) = this.io() else {
            return Poll::Ready(Err(closed()));
        };

        loop {
            let mut guard = ready!(io.poll_write_ready(cx))?;
            match guard.try_io(|inner| sys::write_packet(inner.get_ref(), packet)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
