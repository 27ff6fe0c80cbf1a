//! D-Bus transport information module.
//!
//! This module provides the transport part of a D-Bus address and the
//! connected-stream type produced by it.

use crate::{Error, Result};
use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{SocketAddr, UnixStream};

mod tcp;
pub use tcp::Tcp;
mod unix;
pub use unix::{Unix, UnixSocket};

#[cfg(target_os = "linux")]
use std::os::linux::net::SocketAddrExt;

/// The transport properties of a D-Bus address.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Transport {
    /// A Unix domain socket address.
    Unix(Unix),
    /// A TCP address.
    Tcp(Tcp),
}

/// A connected client stream, before any handshake has run on it.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl Transport {
    pub(crate) fn connect(self) -> Result<Stream> {
        match self {
            Transport::Unix(unix) => {
                let addr = match unix.take_path() {
                    UnixSocket::File(path) => SocketAddr::from_pathname(path)?,
                    #[cfg(target_os = "linux")]
                    UnixSocket::Abstract(name) => {
                        SocketAddr::from_abstract_name(name.as_encoded_bytes())?
                    }
                    UnixSocket::Dir(_) | UnixSocket::TmpDir(_) => {
                        // you can't connect to a unix:dir
                        return Err(Error::Unsupported);
                    }
                };
                let stream = UnixStream::connect_addr(&addr)?;
                stream.set_nonblocking(false)?;

                Ok(Stream::Unix(stream))
            }
            Transport::Tcp(tcp) => {
                let stream = TcpStream::connect((tcp.host(), tcp.port()))?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;

                Ok(Stream::Tcp(stream))
            }
        }
    }

    // Helper for `FromStr` impl of `Address`.
    pub(super) fn from_options(transport: &str, options: &HashMap<&str, String>) -> Result<Self> {
        match transport {
            "unix" => Unix::from_options(options).map(Self::Unix),
            "tcp" => Tcp::from_options(options).map(Self::Tcp),
            _ => Err(Error::Address(format!(
                "unsupported transport '{transport}'"
            ))),
        }
    }
}
