//! Connection-level D-Bus protocol engine.
//!
//! `corebus` implements the pieces every D-Bus participant shares: the
//! SASL-style authentication state machine (EXTERNAL and DBUS_COOKIE_SHA1),
//! local-socket transports with credential passing, the wire-format message
//! loader, a dispatching [`Connection`] with pending-call correlation, the
//! per-user cookie keyring, and a listening [`Server`]. Host event loops
//! integrate through the [`Watch`]/[`Timeout`] contract; a reference
//! poll-based [`MainLoop`] is included.

use std::os::fd::RawFd;

mod error;
pub use error::{Error, Result};

pub mod address;
pub use address::Address;

mod guid;
pub use guid::{Guid, OwnedGuid};

mod bytebuf;

pub mod credentials;
pub use credentials::Credentials;

pub mod userdb;

pub mod keyring;
pub use keyring::Keyring;

mod sha1;

pub mod names;

pub mod message;
pub use message::{Message, MessageLoader};

pub mod watch;
pub use watch::{Watch, WatchFlags};

pub mod timeout;
pub use timeout::Timeout;

pub mod connection;
/// Alias for `connection` module, for convenience.
pub use connection as conn;
pub use connection::{
    AuthMechanism, Connection, DispatchStatus, HandlerResult, PendingCall,
};

pub mod mainloop;
pub use mainloop::MainLoop;

pub mod server;
pub use server::Server;

mod utils;

/// Switch a file descriptor between blocking and non-blocking mode.
///
/// Connections flip their fd to non-blocking right after the handshake and
/// poll for readiness from then on. Returns whether the flags were updated.
pub fn set_blocking(fd: RawFd, blocking: bool) -> bool {
    // SAFETY: F_GETFL/F_SETFL only read and update the open-file status
    // flags of an fd the caller owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return false;
        }

        let flags = if blocking {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };

        libc::fcntl(fd, libc::F_SETFL, flags) != -1
    }
}
