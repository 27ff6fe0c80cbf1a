//! Pending method-call correlation records.

use std::{
    num::NonZeroU32,
    sync::{Arc, Mutex, Weak},
};

use crate::{message::Message, timeout::Timeout, Error, Result};

use super::{Connection, ConnectionInner};

/// Shared completion state for one outstanding call, keyed by its serial in
/// the connection's pending table.
#[derive(Debug)]
pub(super) struct PendingState {
    pub(super) serial: NonZeroU32,
    pub(super) timeout: Timeout,
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    completed: bool,
    reply: Option<Message>,
}

impl PendingState {
    pub(super) fn new(serial: NonZeroU32, timeout: Timeout) -> Arc<Self> {
        Arc::new(Self {
            serial,
            timeout,
            slot: Mutex::new(Slot::default()),
        })
    }

    /// Store the reply and mark completion. The first completion wins; a
    /// reply racing a timeout is dropped.
    pub(super) fn complete(&self, reply: Message) {
        if let Ok(mut slot) = self.slot.lock() {
            if !slot.completed {
                slot.completed = true;
                slot.reply = Some(reply);
            }
        }
        self.timeout.disarm();
    }

    pub(super) fn is_completed(&self) -> bool {
        self.slot.lock().map(|s| s.completed).unwrap_or(true)
    }

    fn take_reply(&self) -> Option<Message> {
        self.slot.lock().ok().and_then(|mut s| s.reply.take())
    }
}

/// An outstanding method call awaiting its reply.
///
/// Created by `Connection::send_with_reply`. Resolves when a message with a
/// matching reply-serial arrives, when the timeout fires, or when the
/// connection disconnects; each outcome stores a reply message (possibly a
/// synthesized error). The pending call holds only a weak handle back to its
/// connection, so dropping the connection does not leak through here.
#[derive(Debug)]
pub struct PendingCall {
    pub(super) conn: Weak<ConnectionInner>,
    pub(super) state: Arc<PendingState>,
}

impl PendingCall {
    /// The serial of the call this record tracks.
    pub fn serial(&self) -> NonZeroU32 {
        self.state.serial
    }

    /// Whether a reply (or synthesized error) has arrived.
    pub fn completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Remove the stored reply, once completed.
    pub fn steal_reply(&self) -> Option<Message> {
        self.state.take_reply()
    }

    /// Block the calling thread, driving the connection, until completion or
    /// the call's timeout. Returns the reply message; error replies are
    /// converted by [`PendingCall::block_and_convert`].
    pub fn block(&self) -> Result<Message> {
        let conn = Connection::from_weak(&self.conn).ok_or(Error::Disconnected)?;
        conn.block_on_pending(&self.state)?;
        self.steal_reply().ok_or(Error::Disconnected)
    }

    /// [`PendingCall::block`], mapping an error reply onto `Err`.
    pub fn block_and_convert(&self) -> Result<Message> {
        reply_to_result(self.block()?)
    }

    /// Sleep until completion or `timeout`, without driving the connection.
    ///
    /// For threads other than the one running the event loop (or a blocking
    /// call): they are woken through the connection's completion condition
    /// variable. Returns whether the call completed.
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        match Connection::from_weak(&self.conn) {
            Some(conn) => conn.wait_on_pending(&self.state, timeout),
            None => self.completed(),
        }
    }

    /// Forget the call: the entry leaves the pending table, its timeout is
    /// cancelled, and a late reply will be routed to filters instead.
    pub fn cancel(&self) {
        if let Some(conn) = Connection::from_weak(&self.conn) {
            conn.cancel_pending(&self.state);
        }
        self.state.timeout.disarm();
    }
}

/// Turn a reply message into a `Result`: method returns pass through, error
/// replies become `Err` carrying `{name, message}`.
pub(crate) fn reply_to_result(reply: Message) -> Result<Message> {
    match reply.message_type() {
        crate::message::Type::Error => {
            let name = reply
                .header()
                .error_name()
                .map(|n| n.as_str().to_owned())
                .unwrap_or_else(|| "org.freedesktop.DBus.Error.Failed".to_owned());
            let text = reply.body_first_string();
            Err(Error::from_error_reply(&name, text))
        }
        _ => Ok(reply),
    }
}
