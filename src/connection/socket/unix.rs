use std::{
    io::{self, IoSlice, IoSliceMut},
    mem::MaybeUninit,
    os::{
        fd::OwnedFd,
        unix::{
            io::{AsRawFd, BorrowedFd, RawFd},
            net::UnixStream,
        },
    },
    sync::Arc,
};

use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};

use crate::credentials::Credentials;
use crate::utils::FDS_MAX;

use super::{ReadHalf, RecvResult, WriteHalf};

impl ReadHalf for Arc<UnixStream> {
    fn as_raw_fd(&self) -> RawFd {
        self.as_ref().as_raw_fd()
    }

    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvResult {
        loop {
            match fd_recvmsg(self.as_ref().as_raw_fd(), buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => break v,
            }
        }
    }

    fn can_pass_unix_fd(&self) -> bool {
        true
    }

    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        get_unix_peer_creds(self.as_ref())
    }
}

impl WriteHalf for Arc<UnixStream> {
    fn as_raw_fd(&self) -> RawFd {
        self.as_ref().as_raw_fd()
    }

    fn sendmsg(&mut self, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        loop {
            match fd_sendmsg(self.as_ref().as_raw_fd(), buffer, fds) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => break v,
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.as_ref().shutdown(std::net::Shutdown::Both)
    }

    fn can_pass_unix_fd(&self) -> bool {
        true
    }

    fn peer_credentials(&mut self) -> io::Result<Credentials> {
        get_unix_peer_creds(self.as_ref())
    }

    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    fn send_zero_byte(&mut self) -> io::Result<Option<usize>> {
        send_zero_byte(self.as_ref()).map(Some)
    }
}

fn fd_recvmsg(fd: RawFd, buffer: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };

    let mut iov = [IoSliceMut::new(buffer)];

    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(FDS_MAX))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut space);

    let msg = rustix::net::recvmsg(
        fd,
        &mut iov,
        &mut cmsg_buffer,
        rustix::net::RecvFlags::empty(),
    )?;

    let fds: Vec<_> = cmsg_buffer
        .drain()
        .filter_map(|cmsg| match cmsg {
            RecvAncillaryMessage::ScmRights(fds) => Some(fds),
            _ => None,
        })
        .flatten()
        .collect();

    Ok((msg.bytes, fds))
}

fn fd_sendmsg(fd: RawFd, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let iov = [IoSlice::new(buffer)];

    let mut space = if !fds.is_empty() {
        vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))]
    } else {
        vec![]
    };

    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut space);
    if !fds.is_empty() {
        cmsg_buffer.push(SendAncillaryMessage::ScmRights(fds));
    }

    match rustix::net::sendmsg(fd, &iov, &mut cmsg_buffer, SendFlags::empty())? {
        // can it really happen?
        0 => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "failed to write to buffer",
        )),
        n => Ok(n),
    }
}

fn get_unix_peer_creds(fd: &impl AsRawFd) -> io::Result<Credentials> {
    let fd = fd.as_raw_fd();
    // SAFETY: the fd stays open for the duration of the call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    Credentials::from_socket(fd)
}

// Send 0 byte as a separate SCM_CREDS message.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn send_zero_byte(fd: &impl AsRawFd) -> io::Result<usize> {
    use nix::sys::socket;

    let iov = [std::io::IoSlice::new(b"\0")];
    socket::sendmsg::<()>(
        fd.as_raw_fd(),
        &iov,
        &[socket::ControlMessage::ScmCreds],
        socket::MsgFlags::empty(),
        None,
    )
    .map_err(|e| io::Error::from_raw_os_error(e as i32))
}
