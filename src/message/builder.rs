use std::os::fd::OwnedFd;

use crate::{
    names::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath, Signature, UniqueName},
    Error, Result,
};

use super::{
    fields::Fields,
    header::{Flags, Header, PrimaryHeader, Type, MAX_MESSAGE_SIZE},
    marshal::{Endian, Writer},
    Message,
};

use enumflags2::BitFlags;

/// A builder for [`Message`].
///
/// Bodies are supplied as pre-marshalled bytes together with their signature;
/// the value model that produces those bytes lives above this crate.
#[derive(Debug, Clone)]
pub struct Builder {
    header: Header,
}

impl Builder {
    pub(super) fn new(msg_type: Type) -> Self {
        let primary = PrimaryHeader::new(msg_type, 0);
        let fields = Fields::new();
        let header = Header::new(primary, fields);
        Self { header }
    }

    /// Add flags to the message.
    ///
    /// See [`Flags`] documentation for the meaning of the flags.
    ///
    /// The function will return an error if invalid flags are given for the
    /// message type.
    pub fn with_flags(mut self, flag: Flags) -> Result<Self> {
        if self.header.message_type() != Type::MethodCall
            && BitFlags::from_flag(flag).contains(Flags::NoReplyExpected)
        {
            return Err(Error::InvalidField);
        }
        let flags = self.header.primary().flags() | flag;
        self.header.primary_mut().set_flags(flags);
        Ok(self)
    }

    /// Set the unique name of the sending connection.
    pub fn sender<S>(mut self, sender: S) -> Result<Self>
    where
        S: TryInto<UniqueName>,
        S::Error: Into<Error>,
    {
        self.header.fields_mut().sender = Some(sender.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Set the object to send a call to, or the object a signal is emitted
    /// from.
    pub fn path<P>(mut self, path: P) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        self.header.fields_mut().path = Some(path.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Set the interface to invoke a method call on, or that a signal is
    /// emitted from.
    pub fn interface<I>(mut self, interface: I) -> Result<Self>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        self.header.fields_mut().interface = Some(interface.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Set the member, either the method name or signal name.
    pub fn member<M>(mut self, member: M) -> Result<Self>
    where
        M: TryInto<MemberName>,
        M::Error: Into<Error>,
    {
        self.header.fields_mut().member = Some(member.try_into().map_err(Into::into)?);
        Ok(self)
    }

    pub(super) fn error_name<E>(mut self, error: E) -> Result<Self>
    where
        E: TryInto<ErrorName>,
        E::Error: Into<Error>,
    {
        self.header.fields_mut().error_name = Some(error.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Set the name of the connection this message is intended for.
    pub fn destination<D>(mut self, destination: D) -> Result<Self>
    where
        D: TryInto<BusName>,
        D::Error: Into<Error>,
    {
        self.header.fields_mut().destination = Some(destination.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Correlate this message with the call carrying `serial`.
    pub(crate) fn reply_serial(mut self, serial: std::num::NonZeroU32) -> Self {
        self.header.fields_mut().reply_serial = Some(serial);
        self
    }

    pub(super) fn reply_to(mut self, reply_to: &Header) -> Result<Self> {
        let serial = reply_to
            .primary()
            .serial_num()
            .ok_or(Error::InvalidField)?;
        self.header.fields_mut().reply_serial = Some(serial);
        self = self.endian(reply_to.primary().endian());

        if let Some(sender) = reply_to.sender() {
            self.destination(sender.as_str())
        } else {
            Ok(self)
        }
    }

    /// Set the endianness of the message.
    ///
    /// The default endianness is native.
    pub fn endian(mut self, endian: Endian) -> Self {
        self.header.primary_mut().set_endian_sig(endian.into());

        self
    }

    /// Build the [`Message`] without a body.
    pub fn build_empty(self) -> Result<Message> {
        self.build_generic(Signature::empty(), Vec::new(), Vec::new())
    }

    /// Build the [`Message`] with the given pre-marshalled body.
    ///
    /// `body` must be the message body marshalled in this message's
    /// endianness according to `signature`; the builder checks the signature
    /// is well-formed but does not re-validate the bytes against it.
    pub fn build_body<S>(self, signature: S, body: Vec<u8>) -> Result<Message>
    where
        S: TryInto<Signature>,
        S::Error: Into<Error>,
    {
        let signature = signature.try_into().map_err(Into::into)?;
        self.build_generic(signature, body, Vec::new())
    }

    /// Like [`Builder::build_body`], with file descriptors to pass along.
    pub fn build_body_with_fds<S>(
        self,
        signature: S,
        body: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> Result<Message>
    where
        S: TryInto<Signature>,
        S::Error: Into<Error>,
    {
        let signature = signature.try_into().map_err(Into::into)?;
        self.build_generic(signature, body, fds)
    }

    fn build_generic(
        mut self,
        signature: Signature,
        body: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> Result<Message> {
        let body_len: u32 = body.len().try_into().map_err(|_| Error::ExcessData)?;
        self.header.primary_mut().set_body_len(body_len);
        let msg_type = self.header.message_type();
        self.header.fields().check_required(msg_type)?;

        if !signature.is_empty() {
            self.header.fields_mut().signature = Some(signature);
        }
        if !fds.is_empty() {
            let n: u32 = fds.len().try_into().map_err(|_| Error::ExcessData)?;
            self.header.fields_mut().unix_fds = Some(n);
        }

        let mut writer = Writer::new(self.header.primary().endian());
        self.header.primary().write(&mut writer);
        self.header.fields().write(&mut writer);
        // The body begins on an 8-byte boundary.
        writer.align(8);
        let body_offset = writer.len();

        if body_offset + body.len() > MAX_MESSAGE_SIZE {
            return Err(Error::ExcessData);
        }

        let mut bytes = writer.into_bytes();
        bytes.extend_from_slice(&body);

        Ok(Message::from_built_parts(self.header, bytes, body_offset, fds))
    }
}

impl From<&Message> for Builder {
    /// Start a builder from an existing message's header, e.g. to re-send
    /// with different routing fields. Signature and fd count are dropped;
    /// the body-supplying build methods reinstate them.
    fn from(msg: &Message) -> Self {
        let mut header = msg.header().clone();
        header.fields_mut().signature = None;
        header.fields_mut().unix_fds = None;

        Self { header }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reply_flag_restricted_to_method_calls() {
        assert!(Message::method("/", "Ping")
            .unwrap()
            .with_flags(Flags::NoReplyExpected)
            .is_ok());
        assert!(Message::signal("/", "org.example.Iface", "Pong")
            .unwrap()
            .with_flags(Flags::NoReplyExpected)
            .is_err());
        assert!(Message::signal("/", "org.example.Iface", "Pong")
            .unwrap()
            .with_flags(Flags::NoAutoStart)
            .is_ok());
    }

    #[test]
    fn missing_required_fields_fail_build() {
        // A method call without a member.
        let builder = Builder::new(Type::MethodCall).path("/org/x").unwrap();
        assert!(matches!(builder.build_empty(), Err(Error::InvalidField)));
    }

    #[test]
    fn big_endian_build_parses_back() {
        let msg = Message::method("/obj", "Swap")
            .unwrap()
            .endian(Endian::Big)
            .build_empty()
            .unwrap()
            .with_serial(std::num::NonZeroU32::new(9).unwrap());

        assert_eq!(msg.data()[0], b'B');
        let parsed = Message::from_bytes(msg.data().to_vec(), vec![]).unwrap();
        assert_eq!(
            parsed.primary_header().serial_num(),
            std::num::NonZeroU32::new(9)
        );
        assert_eq!(parsed.header().member().map(|m| m.as_str()), Some("Swap"));
    }
}
