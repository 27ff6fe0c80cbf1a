//! D-Bus Message.
use std::{fmt, num::NonZeroU32, os::fd::OwnedFd, sync::Arc};

use crate::{Error, Result};

mod builder;
pub use builder::Builder;

mod field_code;

mod fields;
use fields::Fields;

pub(crate) mod marshal;
pub use marshal::{Endian, NATIVE_ENDIAN};
use marshal::Reader;

pub(crate) mod header;
use header::{MIN_MESSAGE_SIZE, PRIMARY_HEADER_SIZE};
pub use header::{EndianSig, Flags, Header, PrimaryHeader, Type, NATIVE_ENDIAN_SIG};

pub(crate) mod loader;
pub use loader::MessageLoader;

/// A position in the stream of [`Message`] objects received by a single
/// connection.
///
/// Note: the relative ordering of values obtained from distinct connections
/// is not specified; only sequence numbers originating from the same
/// connection should be compared.
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Sequence {
    recv_seq: u64,
}

/// A D-Bus message.
///
/// The content of the message is stored in serialized form; the header is
/// parsed up front, the body stays raw bytes described by the `signature`
/// header field. Messages are cheap to clone: clones share one reference-
/// counted allocation, and handing a message to a connection's outbound
/// queue relinquishes the caller's (logical) ownership of it.
///
/// **Note**: The message owns its received FDs and closes them when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    header: Header,
    bytes: Vec<u8>,
    body_offset: usize,
    fds: Vec<OwnedFd>,
    recv_seq: Sequence,
}

impl Message {
    /// Create a builder for a message of type [`Type::MethodCall`].
    pub fn method<P, M>(path: P, method_name: M) -> Result<Builder>
    where
        P: TryInto<crate::names::ObjectPath>,
        M: TryInto<crate::names::MemberName>,
        P::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        Builder::new(Type::MethodCall)
            .path(path)?
            .member(method_name)
    }

    /// Create a builder for a message of type [`Type::Signal`].
    pub fn signal<P, I, M>(path: P, iface: I, signal_name: M) -> Result<Builder>
    where
        P: TryInto<crate::names::ObjectPath>,
        I: TryInto<crate::names::InterfaceName>,
        M: TryInto<crate::names::MemberName>,
        P::Error: Into<Error>,
        I::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        Builder::new(Type::Signal)
            .path(path)?
            .interface(iface)?
            .member(signal_name)
    }

    /// Create a builder for a message of type [`Type::MethodReturn`].
    pub fn method_reply(call: &Self) -> Result<Builder> {
        Builder::new(Type::MethodReturn).reply_to(call.header())
    }

    /// Create a builder for a message of type [`Type::Error`].
    pub fn method_error<E>(call: &Self, name: E) -> Result<Builder>
    where
        E: TryInto<crate::names::ErrorName>,
        E::Error: Into<Error>,
    {
        Builder::new(Type::Error)
            .error_name(name)?
            .reply_to(call.header())
    }

    /// Create a message from wire bytes.
    ///
    /// The bytes must hold exactly one complete message. The header is
    /// validated, including the required-field matrix for the message type.
    pub fn from_bytes(bytes: Vec<u8>, fds: Vec<OwnedFd>) -> Result<Self> {
        let mut fds = fds;
        Self::from_raw_parts(bytes, &mut fds, 0)
    }

    /// Parse one message, taking as many fds from `fds` as its `unix-fds`
    /// header field declares; the rest stay for the next message.
    pub(crate) fn from_raw_parts(
        bytes: Vec<u8>,
        fds: &mut Vec<OwnedFd>,
        recv_seq: u64,
    ) -> Result<Self> {
        if bytes.len() < MIN_MESSAGE_SIZE {
            return Err(Error::CorruptedMessage("truncated message".into()));
        }

        let endian_sig = EndianSig::try_from(bytes[0])?;
        let mut reader = Reader::new(&bytes, endian_sig.into());

        let primary = PrimaryHeader::read(&mut reader)?;
        let fields = Fields::read(&mut reader)?;
        fields.check_required(primary.msg_type())?;

        reader.align(8)?;
        let body_offset = reader.pos();

        if bytes.len() - body_offset != primary.body_len() as usize {
            return Err(Error::CorruptedMessage(
                "body length disagrees with header".into(),
            ));
        }

        let declared_fds = fields.unix_fds.unwrap_or(0) as usize;
        let taken: Vec<OwnedFd> = fds.drain(..declared_fds.min(fds.len())).collect();

        let header = Header::new(primary, fields);

        Ok(Self {
            inner: Arc::new(Inner {
                header,
                bytes,
                body_offset,
                fds: taken,
                recv_seq: Sequence { recv_seq },
            }),
        })
    }

    pub(crate) fn from_built_parts(
        header: Header,
        bytes: Vec<u8>,
        body_offset: usize,
        fds: Vec<OwnedFd>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                header,
                bytes,
                body_offset,
                fds,
                recv_seq: Sequence::default(),
            }),
        }
    }

    /// A copy of this message carrying the given serial.
    ///
    /// Serials belong to the sending connection, which stamps one in right
    /// before queueing the message on the wire.
    pub(crate) fn with_serial(&self, serial: NonZeroU32) -> Self {
        let mut bytes = self.inner.bytes.clone();
        let mut header = self.inner.header.clone();
        header.primary_mut().set_serial_num(serial);

        let slot = &mut bytes[8..PRIMARY_HEADER_SIZE];
        match header.primary().endian() {
            Endian::Little => slot.copy_from_slice(&serial.get().to_le_bytes()),
            Endian::Big => slot.copy_from_slice(&serial.get().to_be_bytes()),
        }

        // The stamped copy is the one that reaches the wire; it needs its
        // own fd handles.
        let fds = self
            .inner
            .fds
            .iter()
            .filter_map(|fd| fd.try_clone().ok())
            .collect();

        Self {
            inner: Arc::new(Inner {
                header,
                bytes,
                body_offset: self.inner.body_offset,
                fds,
                recv_seq: Sequence::default(),
            }),
        }
    }

    /// The primary header of the message.
    pub fn primary_header(&self) -> &PrimaryHeader {
        self.inner.header.primary()
    }

    /// The message header.
    pub fn header(&self) -> &Header {
        &self.inner.header
    }

    /// The message type.
    pub fn message_type(&self) -> Type {
        self.inner.header.primary().msg_type()
    }

    /// The raw body bytes, to be interpreted per the `signature` header
    /// field.
    pub fn body(&self) -> &[u8] {
        &self.inner.bytes[self.inner.body_offset..]
    }

    /// The full wire encoding of the message.
    pub fn data(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// The file descriptors accompanying the message.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.inner.fds
    }

    /// Get the receive ordering of a message.
    ///
    /// This may be used to identify how two events were ordered on the
    /// connection. It is unrelated to the serial number, which the sending
    /// peer assigns.
    pub fn recv_position(&self) -> Sequence {
        self.inner.recv_seq
    }

    /// The first string of the body, when the body starts with one.
    ///
    /// Error replies conventionally carry a human-readable message there.
    pub fn body_first_string(&self) -> Option<String> {
        let sig = self.header().signature()?;
        if !sig.as_str().starts_with('s') {
            return None;
        }
        let mut reader = Reader::new(self.body(), self.primary_header().endian());
        reader.read_string().ok().map(str::to_owned)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = f.debug_struct("Msg");
        let h = self.header();
        msg.field("type", &h.message_type());
        if let Some(serial) = h.primary().serial_num() {
            msg.field("serial", &serial);
        }
        if let Some(sender) = h.sender() {
            msg.field("sender", &sender);
        }
        if let Some(serial) = h.reply_serial() {
            msg.field("reply-serial", &serial);
        }
        if let Some(path) = h.path() {
            msg.field("path", &path);
        }
        if let Some(iface) = h.interface() {
            msg.field("iface", &iface);
        }
        if let Some(member) = h.member() {
            msg.field("member", &member);
        }
        if let Some(sig) = h.signature() {
            msg.field("body", &sig);
        }
        if !self.fds().is_empty() {
            msg.field("fds", &self.fds());
        }

        msg.finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        let (ty, error_name, sender, member) = (
            header.message_type(),
            header.error_name(),
            header.sender(),
            header.member(),
        );

        match ty {
            Type::MethodCall => {
                write!(f, "Method call")?;
                if let Some(m) = member {
                    write!(f, " {m}")?;
                }
            }
            Type::MethodReturn => {
                write!(f, "Method return")?;
            }
            Type::Error => {
                write!(f, "Error")?;
                if let Some(e) = error_name {
                    write!(f, " {e}")?;
                }
                if let Some(msg) = self.body_first_string() {
                    write!(f, ": {msg}")?;
                }
            }
            Type::Signal => {
                write!(f, "Signal")?;
                if let Some(m) = member {
                    write!(f, " {m}")?;
                }
            }
        }

        if let Some(s) = sender {
            write!(f, " from {s}")?;
        }

        Ok(())
    }
}

/// Build a locally-synthesized error reply, as delivered for timeouts and
/// disconnects. The message never hits the wire, so it carries no serial of
/// its own.
pub(crate) fn synthesize_error(
    reply_serial: NonZeroU32,
    name: &str,
    text: &str,
) -> Result<Message> {
    let builder = builder::Builder::new(Type::Error)
        .error_name(name)?
        .reply_serial(reply_serial);

    let mut writer = marshal::Writer::new(NATIVE_ENDIAN_SIG.into());
    writer.write_string(text);
    builder.build_body("s", writer.into_bytes())
}

/// The signal every connection delivers to filters exactly once when it
/// drops.
pub(crate) fn synthesize_disconnected_signal() -> Result<Message> {
    Message::signal(
        "/org/freedesktop/DBus/Local",
        "org.freedesktop.DBus.Local",
        "Disconnected",
    )?
    .build_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_reparse() {
        let msg = Message::method("/org/example/Obj", "Frobnicate")
            .unwrap()
            .destination("org.example.Svc")
            .unwrap()
            .interface("org.example.Iface")
            .unwrap()
            .build_body("s", {
                let mut w = marshal::Writer::new(NATIVE_ENDIAN_SIG.into());
                w.write_string("hello");
                w.into_bytes()
            })
            .unwrap();
        let msg = msg.with_serial(NonZeroU32::new(7).unwrap());

        let parsed = Message::from_bytes(msg.data().to_vec(), vec![]).unwrap();
        assert_eq!(parsed.message_type(), Type::MethodCall);
        assert_eq!(parsed.header().member().map(|m| m.as_str()), Some("Frobnicate"));
        assert_eq!(
            parsed.primary_header().serial_num(),
            NonZeroU32::new(7)
        );
        assert_eq!(parsed.body_first_string().as_deref(), Some("hello"));
        // Re-marshalling a parsed message is byte-identical.
        assert_eq!(parsed.data(), msg.data());
    }

    #[test]
    fn body_length_must_match() {
        let msg = Message::method("/", "Ping").unwrap().build_empty().unwrap();
        let msg = msg.with_serial(NonZeroU32::new(1).unwrap());
        let mut bytes = msg.data().to_vec();
        bytes.extend_from_slice(b"junk");

        assert!(matches!(
            Message::from_bytes(bytes, vec![]),
            Err(Error::CorruptedMessage(_))
        ));
    }

    #[test]
    fn required_fields_enforced_on_parse() {
        // A signal missing its interface.
        let msg = Message::method("/org/x", "Member").unwrap().build_empty().unwrap();
        let mut bytes = msg
            .with_serial(NonZeroU32::new(3).unwrap())
            .data()
            .to_vec();
        bytes[1] = Type::Signal as u8;

        assert!(matches!(
            Message::from_bytes(bytes, vec![]),
            Err(Error::InvalidField)
        ));
    }

    #[test]
    fn zero_serial_is_corrupt() {
        let msg = Message::method("/", "Ping").unwrap().build_empty().unwrap();
        assert!(matches!(
            Message::from_bytes(msg.data().to_vec(), vec![]),
            Err(Error::CorruptedMessage(_))
        ));
    }

    #[test]
    fn reply_correlation_fields() {
        let call = Message::method("/peer", "Echo")
            .unwrap()
            .build_empty()
            .unwrap()
            .with_serial(NonZeroU32::new(42).unwrap());

        let reply = Message::method_reply(&call)
            .unwrap()
            .build_empty()
            .unwrap();
        assert_eq!(reply.header().reply_serial(), NonZeroU32::new(42));
        assert_eq!(reply.message_type(), Type::MethodReturn);

        let err = Message::method_error(&call, "org.example.Failed")
            .unwrap()
            .build_body("s", {
                let mut w = marshal::Writer::new(NATIVE_ENDIAN_SIG.into());
                w.write_string("it broke");
                w.into_bytes()
            })
            .unwrap();
        assert_eq!(err.header().reply_serial(), NonZeroU32::new(42));
        assert_eq!(
            err.header().error_name().map(|e| e.as_str()),
            Some("org.example.Failed")
        );
        assert_eq!(err.body_first_string().as_deref(), Some("it broke"));
    }

    #[test]
    fn reply_to_unsent_call_fails() {
        let call = Message::method("/peer", "Echo").unwrap().build_empty().unwrap();
        assert!(Message::method_reply(&call).is_err());
    }
}
