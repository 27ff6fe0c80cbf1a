//! The inbound framing engine.
//!
//! The transport appends raw socket bytes into the loader's tail buffer;
//! `queue_messages` then carves as many complete, validated messages off the
//! front as the bytes allow. Any framing violation latches the corruption
//! flag, after which the owning connection must disconnect.

use std::{collections::VecDeque, os::fd::OwnedFd};

use log::{trace, warn};

use crate::{utils::padding_for_8_bytes, Error};

use super::{
    header::{EndianSig, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE},
    marshal::Reader,
    Message,
};

/// Default cap on bytes held in not-yet-dispatched messages before the
/// loader asks for the read side to pause.
const DEFAULT_MAX_LIVE_MESSAGES_SIZE: usize = 32 * 1024 * 1024;

/// Turns the incoming byte stream into a queue of framed messages.
#[derive(Debug)]
pub struct MessageLoader {
    buffer: Vec<u8>,
    returned: usize,
    queue: VecDeque<Message>,
    queued_bytes: usize,
    corrupted: bool,
    max_message_size: usize,
    max_live_messages_size: usize,
    pending_fds: Vec<OwnedFd>,
    recv_seq: u64,
}

impl Default for MessageLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLoader {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            returned: 0,
            queue: VecDeque::new(),
            queued_bytes: 0,
            corrupted: false,
            max_message_size: MAX_MESSAGE_SIZE,
            max_live_messages_size: DEFAULT_MAX_LIVE_MESSAGES_SIZE,
            pending_fds: Vec::new(),
            recv_seq: 0,
        }
    }

    /// Cap on the total length of a single message.
    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size.min(MAX_MESSAGE_SIZE);
    }

    /// Cap on queued-but-undispatched bytes before [`Self::is_paused`].
    pub fn set_max_live_messages_size(&mut self, size: usize) {
        self.max_live_messages_size = size;
    }

    /// Obtain the writable tail buffer.
    ///
    /// The caller writes up to `size_hint` bytes at the start of the
    /// returned slice and reports the actual count via
    /// [`Self::return_buffer`].
    pub fn get_buffer(&mut self, size_hint: usize) -> &mut [u8] {
        self.returned = self.buffer.len();
        self.buffer.resize(self.returned + size_hint, 0);
        &mut self.buffer[self.returned..]
    }

    /// Report how much of the buffer from [`Self::get_buffer`] was filled.
    pub fn return_buffer(&mut self, written: usize) {
        let end = self.returned + written;
        debug_assert!(end <= self.buffer.len());
        self.buffer.truncate(end);
    }

    /// Append bytes directly; equivalent to a get/fill/return cycle.
    pub fn feed(&mut self, bytes: &[u8]) {
        let buf = self.get_buffer(bytes.len());
        buf.copy_from_slice(bytes);
        self.return_buffer(bytes.len());
    }

    /// Hand over file descriptors received out-of-band alongside the bytes.
    pub fn feed_fds(&mut self, fds: Vec<OwnedFd>) {
        self.pending_fds.extend(fds);
    }

    /// Parse as many complete messages as possible onto the internal queue.
    ///
    /// Framing violations latch [`Self::is_corrupted`]; messages that are
    /// merely invalid (bad name, missing required field) are dropped with a
    /// warning and parsing continues.
    pub fn queue_messages(&mut self) {
        while !self.corrupted {
            let total_len = match self.peek_frame() {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    warn!("corrupt incoming byte stream: {e}");
                    self.corrupted = true;
                    break;
                }
            };

            if self.buffer.len() < total_len {
                // Frame incomplete; wait for more bytes.
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..total_len).collect();

            let msg_type = frame[1];
            if !(1..=4).contains(&msg_type) {
                // Unknown message types must be ignored.
                trace!("ignoring message of unknown type {msg_type}");
                continue;
            }

            self.recv_seq += 1;
            match Message::from_raw_parts(frame, &mut self.pending_fds, self.recv_seq) {
                Ok(msg) => {
                    self.queued_bytes += msg.data().len();
                    self.queue.push_back(msg);
                }
                Err(e @ (Error::InvalidField | Error::InvalidName(_))) => {
                    warn!("dropping invalid message: {e}");
                }
                Err(e) => {
                    warn!("corrupt incoming message: {e}");
                    self.corrupted = true;
                }
            }
        }
    }

    /// Length of the frame at the head of the buffer, when enough of its
    /// header has arrived to tell.
    fn peek_frame(&self) -> crate::Result<Option<usize>> {
        if self.buffer.len() < MIN_MESSAGE_SIZE {
            return Ok(None);
        }

        let endian = EndianSig::try_from(self.buffer[0])?;
        let mut reader = Reader::new(&self.buffer[..MIN_MESSAGE_SIZE], endian.into());
        reader.read_u8()?; // endian marker
        reader.read_u8()?; // message type; unknown values are skipped later
        reader.read_u8()?; // flags; unknown bits ignored
        let protocol_version = reader.read_u8()?;
        if protocol_version != 1 {
            return Err(Error::CorruptedMessage(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        let body_len = reader.read_u32()? as usize;
        let serial = reader.read_u32()?;
        if serial == 0 {
            return Err(Error::CorruptedMessage("zero serial".into()));
        }
        let fields_len = reader.read_u32()? as usize;

        let header_len = MIN_MESSAGE_SIZE + fields_len;
        let total_len = header_len + padding_for_8_bytes(header_len) + body_len;
        if body_len > self.max_message_size || total_len > self.max_message_size {
            return Err(Error::ExcessData);
        }

        Ok(Some(total_len))
    }

    /// Remove one message for dispatch, in arrival order.
    pub fn pop_message(&mut self) -> Option<Message> {
        let msg = self.queue.pop_front()?;
        self.queued_bytes -= msg.data().len();
        Some(msg)
    }

    /// Whether the stream is beyond repair.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Whether the queue holds at least one message.
    pub fn has_messages(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of queued messages.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether reads should pause until the queue drains.
    pub fn is_paused(&self) -> bool {
        self.queued_bytes >= self.max_live_messages_size
    }
}
