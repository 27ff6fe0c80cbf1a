use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::{net::TcpStream, sync::Arc};

use crate::credentials::Credentials;

use super::{ReadHalf, RecvResult, WriteHalf};

impl ReadHalf for Arc<TcpStream> {
    fn as_raw_fd(&self) -> RawFd {
        self.as_ref().as_raw_fd()
    }

    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvResult {
        loop {
            match self.as_ref().read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
                Ok(len) => break Ok((len, vec![])),
            }
        }
    }

    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        // No peer identity crosses a TCP socket.
        Ok(Credentials::empty())
    }
}

impl WriteHalf for Arc<TcpStream> {
    fn as_raw_fd(&self) -> RawFd {
        self.as_ref().as_raw_fd()
    }

    fn sendmsg(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        if !fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fds cannot be sent with a tcp stream",
            ));
        }

        loop {
            match self.as_ref().write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => break v,
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.as_ref().shutdown(std::net::Shutdown::Both)
    }

    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        Ok(Credentials::empty())
    }
}
