//! The post-handshake byte pump.
//!
//! Owns the two socket halves of an authenticated connection. The read side
//! fills the message loader's append buffer; the write side drains the
//! outbound message queue. The transport also owns the two watches whose
//! enabled state the connection keeps in sync with loader backpressure and
//! queue emptiness.

use std::{collections::VecDeque, io, os::fd::AsFd};

use log::trace;

use crate::{
    credentials::Credentials,
    message::{Message, MessageLoader},
    watch::{Watch, WatchFlags},
    Error, Result,
};

use super::{
    auth::DataCodec,
    socket::{ReadHalf, WriteHalf},
};

/// Read chunk size per recvmsg call.
const READ_CHUNK: usize = 4096;

/// Outcome of one read pass.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum ReadResult {
    /// Some bytes landed in the loader.
    Progress,
    /// Nothing to read right now; the watch stays armed.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
}

/// Outcome of one write pass.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum WriteResult {
    /// The queue is fully drained.
    Empty,
    /// The socket stopped accepting bytes; more remain queued.
    WouldBlock,
}

/// One message in flight on the write side.
#[derive(Debug)]
struct OutMessage {
    msg: Message,
    /// Pre-transformed bytes when an auth security layer is installed.
    encoded: Option<Vec<u8>>,
    pos: usize,
    fds_sent: bool,
}

impl OutMessage {
    fn bytes(&self) -> &[u8] {
        match &self.encoded {
            Some(encoded) => encoded,
            None => self.msg.data(),
        }
    }
}

pub(super) struct Transport {
    read: Box<dyn ReadHalf>,
    write: Box<dyn WriteHalf>,
    read_watch: Watch,
    write_watch: Watch,
    credentials: Credentials,
    outbound: VecDeque<OutMessage>,
    encode_data: Option<DataCodec>,
    decode_data: Option<DataCodec>,
    disconnected: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

impl Transport {
    pub fn new(
        read: Box<dyn ReadHalf>,
        write: Box<dyn WriteHalf>,
        credentials: Credentials,
        encode_data: Option<DataCodec>,
        decode_data: Option<DataCodec>,
    ) -> Self {
        let read_watch = Watch::new(read.as_raw_fd(), WatchFlags::Readable.into(), true);
        let write_watch = Watch::new(write.as_raw_fd(), WatchFlags::Writable.into(), false);

        Self {
            read,
            write,
            read_watch,
            write_watch,
            credentials,
            outbound: VecDeque::new(),
            encode_data,
            decode_data,
            disconnected: false,
        }
    }

    pub fn read_watch(&self) -> &Watch {
        &self.read_watch
    }

    pub fn write_watch(&self) -> &Watch {
        &self.write_watch
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn can_pass_unix_fd(&self) -> bool {
        self.write.can_pass_unix_fd()
    }

    /// Queue a message for the wire. Messages leave in queue order.
    pub fn queue_message(&mut self, msg: Message) {
        let encoded = self.encode_data.as_ref().map(|encode| encode(msg.data()));
        self.outbound.push_back(OutMessage {
            msg,
            encoded,
            pos: 0,
            fds_sent: false,
        });
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// One read pass: pull bytes until the socket would block, EOF, or the
    /// loader asks for a pause.
    pub fn read_into_loader(&mut self, loader: &mut MessageLoader) -> Result<ReadResult> {
        if self.disconnected {
            return Ok(ReadResult::Eof);
        }

        let mut progressed = false;
        loop {
            if loader.is_paused() {
                break;
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.read.recvmsg(&mut chunk) {
                Ok((0, _)) => {
                    trace!("peer closed the stream");
                    return Ok(ReadResult::Eof);
                }
                Ok((n, fds)) => {
                    let bytes = match &self.decode_data {
                        Some(decode) => decode(&chunk[..n]),
                        None => chunk[..n].to_vec(),
                    };
                    loader.feed(&bytes);
                    loader.feed_fds(fds);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    break;
                }
                Err(e) if is_disconnect_error(&e) => {
                    trace!("read error treated as disconnect: {e}");
                    return Ok(ReadResult::Eof);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(if progressed {
            ReadResult::Progress
        } else {
            ReadResult::WouldBlock
        })
    }

    /// One write pass: push queued bytes until drained or the socket blocks.
    pub fn write_outbound(&mut self) -> Result<WriteResult> {
        while let Some(out) = self.outbound.front_mut() {
            let bytes = out.bytes();
            if out.pos >= bytes.len() {
                self.outbound.pop_front();
                continue;
            }

            let fds: Vec<_> = if out.pos == 0 && !out.fds_sent {
                out.msg.fds().iter().map(|f| f.as_fd()).collect()
            } else {
                vec![]
            };

            let chunk = &out.bytes()[out.pos..];
            match self.write.sendmsg(chunk, &fds) {
                Ok(n) => {
                    out.fds_sent = true;
                    out.pos += n;
                    if out.pos >= out.bytes().len() {
                        trace!("sent message with serial {:?}", out.msg.primary_header().serial_num());
                        self.outbound.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteResult::WouldBlock);
                }
                Err(e) if is_disconnect_error(&e) => {
                    trace!("write error treated as disconnect: {e}");
                    return Err(Error::Disconnected);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(WriteResult::Empty)
    }

    /// Tear the connection down. Idempotent.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.outbound.clear();
        let _ = self.write.close();
        self.read_watch.set_enabled(false);
        self.write_watch.set_enabled(false);
    }
}

/// EPIPE-class errors: the peer is gone, not a local fault.
fn is_disconnect_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
