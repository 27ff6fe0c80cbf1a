use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use super::{ReadHalf, Socket, WriteHalf};

/// A pair of socket halves that still travel together.
#[derive(Debug)]
pub struct Split<R, W> {
    pub(super) read: R,
    pub(super) write: W,
}

impl<R: ReadHalf, W: WriteHalf> Split<R, W> {
    pub fn read_mut(&mut self) -> &mut R {
        &mut self.read
    }

    pub fn write_mut(&mut self) -> &mut W {
        &mut self.write
    }

    /// Split `self` into its two halves.
    pub fn take(self) -> (R, W) {
        (self.read, self.write)
    }

    /// Erase the concrete half types.
    pub fn boxed(self) -> BoxedSplit {
        Split {
            read: Box::new(self.read),
            write: Box::new(self.write),
        }
    }
}

/// A [`Split`] with type-erased halves, as carried through the handshake.
pub type BoxedSplit = Split<Box<dyn ReadHalf>, Box<dyn WriteHalf>>;

impl From<UnixStream> for BoxedSplit {
    fn from(stream: UnixStream) -> Self {
        stream.split().boxed()
    }
}

impl From<TcpStream> for BoxedSplit {
    fn from(stream: TcpStream) -> Self {
        stream.split().boxed()
    }
}

impl From<crate::address::Stream> for BoxedSplit {
    fn from(stream: crate::address::Stream) -> Self {
        match stream {
            crate::address::Stream::Unix(s) => s.into(),
            crate::address::Stream::Tcp(s) => s.into(),
        }
    }
}
