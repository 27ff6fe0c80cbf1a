use std::num::NonZeroU32;

use enumflags2::{bitflags, BitFlags};

use crate::{
    names::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath, Signature, UniqueName},
    Error, Result,
};

use super::{
    fields::Fields,
    marshal::{Endian, Reader, Writer},
};

pub(crate) const PRIMARY_HEADER_SIZE: usize = 12;
pub(crate) const MIN_MESSAGE_SIZE: usize = PRIMARY_HEADER_SIZE + 4;
pub(crate) const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024; // 128 MiB

/// D-Bus code for endianness.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndianSig {
    /// The D-Bus message is in big-endian (network) byte order.
    Big = b'B',

    /// The D-Bus message is in little-endian byte order.
    Little = b'l',
}

impl TryFrom<u8> for EndianSig {
    type Error = Error;

    fn try_from(val: u8) -> Result<EndianSig> {
        match val {
            b'B' => Ok(EndianSig::Big),
            b'l' => Ok(EndianSig::Little),
            _ => Err(Error::IncorrectEndian),
        }
    }
}

#[cfg(target_endian = "big")]
/// Signature of the target's native endian.
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Big;
#[cfg(target_endian = "little")]
/// Signature of the target's native endian.
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Little;

/// Message header representing the D-Bus type of the message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Method call. This message type may prompt a reply (and typically does).
    MethodCall = 1,
    /// A reply to a method call.
    MethodReturn = 2,
    /// An error in response to a method call.
    Error = 3,
    /// Signal emission.
    Signal = 4,
}

impl TryFrom<u8> for Type {
    type Error = Error;

    fn try_from(val: u8) -> Result<Type> {
        match val {
            1 => Ok(Type::MethodCall),
            2 => Ok(Type::MethodReturn),
            3 => Ok(Type::Error),
            4 => Ok(Type::Signal),
            _ => Err(Error::InvalidMessageType),
        }
    }
}

/// Pre-defined flags that can be passed in a message header.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flags {
    /// This message does not expect method return replies or error replies,
    /// even if it is of a type that can have a reply; the reply should be
    /// omitted.
    ///
    /// Note that `Type::MethodCall` is the only message type currently
    /// defined in the specification that can expect a reply, so the presence
    /// or absence of this flag in the other three message types that are
    /// currently documented is meaningless: replies to those message types
    /// should not be sent, whether this flag is present or not.
    NoReplyExpected = 0x1,
    /// The bus must not launch an owner for the destination name in response
    /// to this message.
    NoAutoStart = 0x2,
    /// This flag may be set on a method call message to inform the receiving
    /// side that the caller is prepared to wait for interactive
    /// authorization, which might take a considerable time to complete.
    AllowInteractiveAuth = 0x4,
}

/// The primary message header, which is present in all D-Bus messages.
///
/// This header contains all the essential information about a message,
/// regardless of its type.
#[derive(Clone, Debug)]
pub struct PrimaryHeader {
    endian_sig: EndianSig,
    msg_type: Type,
    flags: BitFlags<Flags>,
    protocol_version: u8,
    body_len: u32,
    serial_num: u32,
}

impl PrimaryHeader {
    /// Create a new `PrimaryHeader` instance.
    ///
    /// The serial stays unassigned (and the message unsendable as-is) until
    /// the owning connection stamps one in.
    pub fn new(msg_type: Type, body_len: u32) -> Self {
        Self {
            endian_sig: NATIVE_ENDIAN_SIG,
            msg_type,
            flags: BitFlags::empty(),
            protocol_version: 1,
            body_len,
            serial_num: 0,
        }
    }

    /// Parse the 12 fixed bytes. The endianness marker must already have been
    /// used to construct the `Reader`.
    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<PrimaryHeader> {
        let endian_sig = EndianSig::try_from(reader.read_u8()?)?;
        let msg_type = Type::try_from(reader.read_u8()?)?;
        // Unknown flag bits must be ignored.
        let flags = BitFlags::from_bits_truncate(reader.read_u8()?);
        let protocol_version = reader.read_u8()?;
        if protocol_version != 1 {
            return Err(Error::CorruptedMessage(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        let body_len = reader.read_u32()?;
        let serial_num = reader.read_u32()?;
        if serial_num == 0 {
            return Err(Error::CorruptedMessage("zero serial".into()));
        }

        Ok(Self {
            endian_sig,
            msg_type,
            flags,
            protocol_version,
            body_len,
            serial_num,
        })
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.endian_sig as u8);
        writer.write_u8(self.msg_type as u8);
        writer.write_u8(self.flags.bits());
        writer.write_u8(self.protocol_version);
        writer.write_u32(self.body_len);
        writer.write_u32(self.serial_num);
    }

    /// D-Bus code for endian encoding of the message.
    pub fn endian_sig(&self) -> EndianSig {
        self.endian_sig
    }

    /// Set the D-Bus code for endian encoding of the message.
    pub fn set_endian_sig(&mut self, sig: EndianSig) {
        self.endian_sig = sig;
    }

    pub(crate) fn endian(&self) -> Endian {
        self.endian_sig.into()
    }

    /// The message type.
    pub fn msg_type(&self) -> Type {
        self.msg_type
    }

    /// The message flags.
    pub fn flags(&self) -> BitFlags<Flags> {
        self.flags
    }

    /// Set the message flags.
    pub fn set_flags(&mut self, flags: BitFlags<Flags>) {
        self.flags = flags;
    }

    /// The major version of the protocol the message is compliant to.
    ///
    /// Currently only `1` is valid.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// The byte length of the message body.
    pub fn body_len(&self) -> u32 {
        self.body_len
    }

    /// Set the byte length of the message body.
    pub fn set_body_len(&mut self, len: u32) {
        self.body_len = len;
    }

    /// The serial number of the message, if one has been assigned.
    ///
    /// This is used to match a reply to a method call. It is assigned by the
    /// sending connection, so a freshly built message has none.
    pub fn serial_num(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.serial_num)
    }

    pub(crate) fn set_serial_num(&mut self, serial_num: NonZeroU32) {
        self.serial_num = serial_num.get();
    }
}

/// The message header, containing all the metadata about the message.
///
/// This includes both the [`PrimaryHeader`] and the typed header fields.
#[derive(Clone, Debug)]
pub struct Header {
    primary: PrimaryHeader,
    fields: Fields,
}

impl Header {
    pub(super) fn new(primary: PrimaryHeader, fields: Fields) -> Self {
        Self { primary, fields }
    }

    /// Get a reference to the primary header.
    pub fn primary(&self) -> &PrimaryHeader {
        &self.primary
    }

    pub(super) fn primary_mut(&mut self) -> &mut PrimaryHeader {
        &mut self.primary
    }

    pub(super) fn fields(&self) -> &Fields {
        &self.fields
    }

    pub(super) fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    /// The message type.
    pub fn message_type(&self) -> Type {
        self.primary().msg_type()
    }

    /// The object to send a call to, or the object a signal is emitted from.
    pub fn path(&self) -> Option<&ObjectPath> {
        self.fields.path.as_ref()
    }

    /// The interface to invoke a method call on, or that a signal is emitted
    /// from.
    pub fn interface(&self) -> Option<&InterfaceName> {
        self.fields.interface.as_ref()
    }

    /// The member, either the method name or signal name.
    pub fn member(&self) -> Option<&MemberName> {
        self.fields.member.as_ref()
    }

    /// The name of the error that occurred, for errors.
    pub fn error_name(&self) -> Option<&ErrorName> {
        self.fields.error_name.as_ref()
    }

    /// The serial number of the message this message is a reply to.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        self.fields.reply_serial
    }

    /// The name of the connection this message is intended for.
    pub fn destination(&self) -> Option<&BusName> {
        self.fields.destination.as_ref()
    }

    /// Unique name of the sending connection.
    pub fn sender(&self) -> Option<&UniqueName> {
        self.fields.sender.as_ref()
    }

    /// The signature of the message body.
    pub fn signature(&self) -> Option<&Signature> {
        self.fields.signature.as_ref()
    }

    /// The number of Unix file descriptors that accompany the message.
    pub fn unix_fds(&self) -> Option<u32> {
        self.fields.unix_fds
    }
}
