use std::{error, fmt, io, sync::Arc};

/// The error type for `corebus`.
///
/// The various errors that can be reported by this crate.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid D-Bus address.
    Address(String),
    /// An I/O error.
    InputOutput(Arc<io::Error>),
    /// Invalid message field.
    InvalidField,
    /// Invalid D-Bus name, object path or signature.
    InvalidName(String),
    /// Data too large (message, signature or auth buffer overflow).
    ExcessData,
    /// Endian signature invalid or doesn't match expectation.
    IncorrectEndian,
    /// Incoming byte stream violated the wire format; the connection is dead.
    CorruptedMessage(String),
    /// Initial handshake error.
    Handshake(String),
    /// An error occurred on the keyring used for cookie authentication.
    Keyring(String),
    /// Unexpected or incorrect message type for the requested operation.
    InvalidMessageType,
    /// A D-Bus error reply to a method call, carrying the error name and the
    /// optional human-readable message from the reply body.
    MethodError(String, Option<String>),
    /// A pending call's deadline passed without a reply.
    NoReply,
    /// The connection is (now) disconnected.
    Disconnected,
    /// The requested operation is not supported (e.g. fd passing over TCP).
    Unsupported,
    /// Thread-synchronization state was poisoned by a panic elsewhere.
    Poisoned,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Address(s), Error::Address(o)) => s == o,
            (Error::InvalidField, Error::InvalidField) => true,
            (Error::InvalidName(s), Error::InvalidName(o)) => s == o,
            (Error::ExcessData, Error::ExcessData) => true,
            (Error::IncorrectEndian, Error::IncorrectEndian) => true,
            (Error::CorruptedMessage(s), Error::CorruptedMessage(o)) => s == o,
            (Error::Handshake(s), Error::Handshake(o)) => s == o,
            (Error::Keyring(s), Error::Keyring(o)) => s == o,
            (Error::InvalidMessageType, Error::InvalidMessageType) => true,
            (Error::MethodError(n, m), Error::MethodError(n2, m2)) => n == n2 && m == m2,
            (Error::NoReply, Error::NoReply) => true,
            (Error::Disconnected, Error::Disconnected) => true,
            (Error::Unsupported, Error::Unsupported) => true,
            (Error::Poisoned, Error::Poisoned) => true,
            (Error::InputOutput(_), Error::InputOutput(_)) => false,
            (_, _) => false,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::InputOutput(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Address(e) => write!(f, "address error: {e}"),
            Error::InputOutput(e) => write!(f, "I/O error: {e}"),
            Error::InvalidField => write!(f, "invalid message field"),
            Error::InvalidName(e) => write!(f, "invalid name: {e}"),
            Error::ExcessData => write!(f, "excess data"),
            Error::IncorrectEndian => write!(f, "incorrect endian"),
            Error::CorruptedMessage(e) => write!(f, "corrupted message stream: {e}"),
            Error::Handshake(e) => write!(f, "authentication error: {e}"),
            Error::Keyring(e) => write!(f, "keyring error: {e}"),
            Error::InvalidMessageType => write!(f, "invalid message type"),
            Error::MethodError(name, None) => write!(f, "{name}"),
            Error::MethodError(name, Some(msg)) => write!(f, "{name}: {msg}"),
            Error::NoReply => write!(f, "timeout waiting for reply"),
            Error::Disconnected => write!(f, "connection is disconnected"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::Poisoned => write!(f, "internal lock poisoned"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(val: io::Error) -> Self {
        Error::InputOutput(Arc::new(val))
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(val: rustix::io::Errno) -> Self {
        io::Error::from(val).into()
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Handshake(format!("invalid hex encoding: {e}"))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Handshake(format!("invalid base64 encoding: {e}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Poisoned
    }
}

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// D-Bus error name sent in reply to a call on an unregistered method.
pub(crate) const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
/// D-Bus error name synthesized when a pending call times out.
pub(crate) const ERR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
/// D-Bus error name synthesized when the connection drops with calls in flight.
pub(crate) const ERR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";

impl Error {
    /// Map a D-Bus error reply into an `Error`.
    ///
    /// The synthetic reply names used for local conditions map back onto their
    /// dedicated variants so callers can match on them directly.
    pub(crate) fn from_error_reply(name: &str, message: Option<String>) -> Self {
        match name {
            ERR_NO_REPLY => Error::NoReply,
            ERR_DISCONNECTED => Error::Disconnected,
            _ => Error::MethodError(name.to_owned(), message),
        }
    }
}
