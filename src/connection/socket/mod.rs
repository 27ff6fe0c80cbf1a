//! Byte-stream endpoints under a connection.
//!
//! A connection reads and writes concurrently, so a socket is consumed as a
//! [`ReadHalf`]/[`WriteHalf`] pair ([`Split`]). Both halves expose the raw
//! fd because everything above them is poll-driven: the transport registers
//! watches on it and only touches the halves when the host loop reports
//! readiness. Unix sockets additionally move file descriptors and peer
//! credentials through the ancillary channel; transports that cannot (TCP)
//! simply report neither.

mod split;
pub use split::{BoxedSplit, Split};

mod tcp;
mod unix;

use std::io;
use std::sync::Arc;

use crate::credentials::Credentials;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

/// Bytes read plus any fds that rode along in the same ancillary message.
pub(crate) type RecvResult = io::Result<(usize, Vec<OwnedFd>)>;

/// A transport that can be split into its two directions.
///
/// Implemented out of the box for `std` Unix and TCP streams; implement it
/// for other byte streams to plug them under a connection.
pub trait Socket {
    type ReadHalf: ReadHalf;
    type WriteHalf: WriteHalf;

    /// Consume the socket, yielding the two halves.
    fn split(self) -> Split<Self::ReadHalf, Self::WriteHalf>
    where
        Self: Sized;
}

/// The receiving direction of a split socket.
pub trait ReadHalf: std::fmt::Debug + Send + Sync + 'static {
    /// The fd the host loop should poll for readability.
    fn as_raw_fd(&self) -> RawFd;

    /// Pull whatever the socket has, up to `buf.len()` bytes.
    ///
    /// Returns the byte count together with any file descriptors received
    /// out-of-band. A count of zero means the peer closed its end. The fd
    /// is expected to be non-blocking once a connection owns it, so
    /// `WouldBlock` is an ordinary outcome.
    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvResult;

    /// Whether fds can arrive on this transport. False unless overridden.
    fn can_pass_unix_fd(&self) -> bool {
        false
    }

    /// The identity of the peer, as far as the OS can vouch for it.
    ///
    /// Transports without a kernel-verified peer return the empty set.
    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        Ok(Credentials::empty())
    }
}

/// The sending direction of a split socket.
pub trait WriteHalf: std::fmt::Debug + Send + Sync + 'static {
    /// The fd the host loop should poll for writability.
    fn as_raw_fd(&self) -> RawFd;

    /// Push bytes at the socket, returning how many it took.
    ///
    /// Short writes are normal; the caller re-offers the remainder when the
    /// fd is writable again. Once a single byte went through, every fd in
    /// `fds` went with it and must not be offered again. Transports without
    /// fd passing fail with `ErrorKind::InvalidInput` when `fds` is
    /// nonempty.
    fn sendmsg(&mut self, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;

    /// Shut the socket down; subsequent I/O on either half may fail.
    fn close(&mut self) -> io::Result<()>;

    /// Whether fds can be sent on this transport. False unless overridden.
    fn can_pass_unix_fd(&self) -> bool {
        false
    }

    /// The identity of the peer, as far as the OS can vouch for it.
    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        Ok(Credentials::empty())
    }

    /// On FreeBSD and Dragonfly the credential nul byte must travel as its
    /// own SCM_CREDS message; unix-socket implementations provide this.
    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    fn send_zero_byte(&mut self) -> io::Result<Option<usize>> {
        Ok(None)
    }
}

// Boxed halves forward everything, so `BoxedSplit` is a full peer of any
// concrete split.

impl ReadHalf for Box<dyn ReadHalf> {
    fn as_raw_fd(&self) -> RawFd {
        (**self).as_raw_fd()
    }

    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvResult {
        (**self).recvmsg(buf)
    }

    fn can_pass_unix_fd(&self) -> bool {
        (**self).can_pass_unix_fd()
    }

    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        (**self).peer_credentials()
    }
}

impl WriteHalf for Box<dyn WriteHalf> {
    fn as_raw_fd(&self) -> RawFd {
        (**self).as_raw_fd()
    }

    fn sendmsg(&mut self, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        (**self).sendmsg(buffer, fds)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn can_pass_unix_fd(&self) -> bool {
        (**self).can_pass_unix_fd()
    }

    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        (**self).peer_credentials()
    }

    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    fn send_zero_byte(&mut self) -> io::Result<Option<usize>> {
        (**self).send_zero_byte()
    }
}

// A stream whose shared handle serves both directions splits by cloning an
// `Arc` of itself; this is how the std stream types come in.
impl<T> Socket for T
where
    T: std::fmt::Debug + Send + Sync,
    Arc<T>: ReadHalf + WriteHalf,
{
    type ReadHalf = Arc<T>;
    type WriteHalf = Arc<T>;

    fn split(self) -> Split<Self::ReadHalf, Self::WriteHalf> {
        let shared = Arc::new(self);
        let read = shared.clone();

        Split {
            read,
            write: shared,
        }
    }
}
