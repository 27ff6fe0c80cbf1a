//! The typed header-field set and its wire codec.
//!
//! On the wire the fields form an array of `(byte, variant)` structs padded
//! to 8-byte element boundaries. Each known field has a fixed variant
//! signature; a mismatch is stream corruption, while an unknown field code is
//! skipped.

use std::num::NonZeroU32;

use crate::{
    names::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath, Signature, UniqueName},
    Error, Result,
};

use super::{
    field_code::FieldCode,
    header::Type,
    marshal::{Reader, Writer},
};

/// All defined header fields of one message.
#[derive(Clone, Debug, Default)]
pub(crate) struct Fields {
    pub path: Option<ObjectPath>,
    pub interface: Option<InterfaceName>,
    pub member: Option<MemberName>,
    pub error_name: Option<ErrorName>,
    pub reply_serial: Option<NonZeroU32>,
    pub destination: Option<BusName>,
    pub sender: Option<UniqueName>,
    pub signature: Option<Signature>,
    pub unix_fds: Option<u32>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the fields required for `msg_type` are all present.
    ///
    /// method-call requires {path, member}; method-return {reply-serial};
    /// error {error-name, reply-serial}; signal {path, interface, member}.
    pub fn check_required(&self, msg_type: Type) -> Result<()> {
        let ok = match msg_type {
            Type::MethodCall => self.path.is_some() && self.member.is_some(),
            Type::MethodReturn => self.reply_serial.is_some(),
            Type::Error => self.error_name.is_some() && self.reply_serial.is_some(),
            Type::Signal => {
                self.path.is_some() && self.interface.is_some() && self.member.is_some()
            }
        };

        if ok {
            Ok(())
        } else {
            Err(Error::InvalidField)
        }
    }

    /// Parse the header-field array. The reader must be positioned on the
    /// array length (offset 12 of the message).
    pub fn read(reader: &mut Reader<'_>) -> Result<Fields> {
        let array_len = reader.read_u32()? as usize;
        let end = reader.pos() + array_len;
        let mut fields = Fields::new();

        while reader.pos() < end {
            reader.align(8)?;
            if reader.pos() >= end {
                break;
            }
            let code = reader.read_u8()?;
            let signature = reader.read_signature_str()?.to_owned();

            // Name validation failures below surface as `Error::InvalidName`,
            // which makes the message invalid (dropped) rather than the
            // stream corrupt.
            match FieldCode::from_byte(code) {
                Some(FieldCode::Path) => {
                    expect_signature(&signature, "o")?;
                    let val = reader.read_string()?;
                    fields.path = Some(ObjectPath::try_from(val)?);
                }
                Some(FieldCode::Interface) => {
                    expect_signature(&signature, "s")?;
                    let val = reader.read_string()?;
                    fields.interface = Some(InterfaceName::try_from(val)?);
                }
                Some(FieldCode::Member) => {
                    expect_signature(&signature, "s")?;
                    let val = reader.read_string()?;
                    fields.member = Some(MemberName::try_from(val)?);
                }
                Some(FieldCode::ErrorName) => {
                    expect_signature(&signature, "s")?;
                    let val = reader.read_string()?;
                    fields.error_name = Some(ErrorName::try_from(val)?);
                }
                Some(FieldCode::ReplySerial) => {
                    expect_signature(&signature, "u")?;
                    let val = reader.read_u32()?;
                    fields.reply_serial = Some(NonZeroU32::new(val).ok_or_else(|| {
                        Error::CorruptedMessage("zero reply serial".into())
                    })?);
                }
                Some(FieldCode::Destination) => {
                    expect_signature(&signature, "s")?;
                    let val = reader.read_string()?;
                    fields.destination = Some(BusName::try_from(val)?);
                }
                Some(FieldCode::Sender) => {
                    expect_signature(&signature, "s")?;
                    let val = reader.read_string()?;
                    fields.sender = Some(UniqueName::try_from(val)?);
                }
                Some(FieldCode::Signature) => {
                    expect_signature(&signature, "g")?;
                    let val = reader.read_signature_str()?;
                    fields.signature = Some(Signature::try_from(val)?);
                }
                Some(FieldCode::UnixFDs) => {
                    expect_signature(&signature, "u")?;
                    fields.unix_fds = Some(reader.read_u32()?);
                }
                None => {
                    // Unknown field: skip its variant payload.
                    reader.skip_value(&signature)?;
                }
            }
        }

        if reader.pos() != end {
            return Err(Error::CorruptedMessage(
                "header field array length mismatch".into(),
            ));
        }

        Ok(fields)
    }

    /// Marshal the field array, including its length prefix. The writer must
    /// be positioned at offset 12 of the message.
    pub fn write(&self, writer: &mut Writer) {
        let len_at = {
            writer.write_u32(0);
            writer.len() - 4
        };
        let start = writer.len();

        if let Some(path) = &self.path {
            write_field_header(writer, FieldCode::Path, "o");
            writer.write_string(path.as_str());
        }
        if let Some(interface) = &self.interface {
            write_field_header(writer, FieldCode::Interface, "s");
            writer.write_string(interface.as_str());
        }
        if let Some(member) = &self.member {
            write_field_header(writer, FieldCode::Member, "s");
            writer.write_string(member.as_str());
        }
        if let Some(error_name) = &self.error_name {
            write_field_header(writer, FieldCode::ErrorName, "s");
            writer.write_string(error_name.as_str());
        }
        if let Some(reply_serial) = self.reply_serial {
            write_field_header(writer, FieldCode::ReplySerial, "u");
            writer.write_u32(reply_serial.get());
        }
        if let Some(destination) = &self.destination {
            write_field_header(writer, FieldCode::Destination, "s");
            writer.write_string(destination.as_str());
        }
        if let Some(sender) = &self.sender {
            write_field_header(writer, FieldCode::Sender, "s");
            writer.write_string(sender.as_str());
        }
        if let Some(signature) = &self.signature {
            write_field_header(writer, FieldCode::Signature, "g");
            writer.write_signature_str(signature.as_str());
        }
        if let Some(unix_fds) = self.unix_fds {
            write_field_header(writer, FieldCode::UnixFDs, "u");
            writer.write_u32(unix_fds);
        }

        let array_len = (writer.len() - start) as u32;
        writer.patch_u32(len_at, array_len);
    }
}

fn write_field_header(writer: &mut Writer, code: FieldCode, signature: &str) {
    writer.align(8);
    writer.write_u8(code as u8);
    writer.write_signature_str(signature);
}

fn expect_signature(actual: &str, expected: &str) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::CorruptedMessage(format!(
            "header field has signature `{actual}`, expected `{expected}`"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::marshal::Endian;

    fn round_trip(fields: &Fields) -> Fields {
        let mut writer = Writer::new(Endian::Little);
        // Field arrays start at offset 12 in a real message; emulate that so
        // alignment matches.
        writer.write_bytes(&[0u8; 12]);
        fields.write(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = Reader::new(&bytes, Endian::Little);
        for _ in 0..12 {
            reader.read_u8().unwrap();
        }
        Fields::read(&mut reader).unwrap()
    }

    #[test]
    fn full_field_set_round_trips() {
        let mut fields = Fields::new();
        fields.path = Some(ObjectPath::try_from("/org/example/Obj").unwrap());
        fields.interface = Some(InterfaceName::try_from("org.example.Iface").unwrap());
        fields.member = Some(MemberName::try_from("Frobnicate").unwrap());
        fields.destination = Some(BusName::try_from(":1.98").unwrap());
        fields.sender = Some(UniqueName::try_from(":1.7").unwrap());
        fields.signature = Some(Signature::try_from("sa{sv}").unwrap());
        fields.reply_serial = NonZeroU32::new(77);
        fields.unix_fds = Some(2);

        let parsed = round_trip(&fields);
        assert_eq!(parsed.path, fields.path);
        assert_eq!(parsed.interface, fields.interface);
        assert_eq!(parsed.member, fields.member);
        assert_eq!(parsed.destination, fields.destination);
        assert_eq!(parsed.sender, fields.sender);
        assert_eq!(parsed.signature, fields.signature);
        assert_eq!(parsed.reply_serial, fields.reply_serial);
        assert_eq!(parsed.unix_fds, fields.unix_fds);
    }

    #[test]
    fn unknown_field_codes_are_skipped() {
        let mut writer = Writer::new(Endian::Little);
        writer.write_bytes(&[0u8; 12]);
        let len_at = {
            writer.write_u32(0);
            writer.len() - 4
        };
        let start = writer.len();
        // Field code 200 carrying a string variant.
        writer.align(8);
        writer.write_u8(200);
        writer.write_signature_str("s");
        writer.write_string("future stuff");
        // Followed by a member we understand.
        writer.align(8);
        writer.write_u8(FieldCode::Member as u8);
        writer.write_signature_str("s");
        writer.write_string("Ping");
        let array_len = (writer.len() - start) as u32;
        writer.patch_u32(len_at, array_len);
        let bytes = writer.into_bytes();

        let mut reader = Reader::new(&bytes, Endian::Little);
        for _ in 0..12 {
            reader.read_u8().unwrap();
        }
        let fields = Fields::read(&mut reader).unwrap();
        assert_eq!(fields.member.as_deref(), Some("Ping"));
    }

    #[test]
    fn required_field_matrix() {
        let mut call = Fields::new();
        call.path = Some(ObjectPath::root());
        assert!(call.check_required(Type::MethodCall).is_err());
        call.member = Some(MemberName::try_from("Ping").unwrap());
        assert!(call.check_required(Type::MethodCall).is_ok());
        assert!(call.check_required(Type::Signal).is_err());

        let mut reply = Fields::new();
        assert!(reply.check_required(Type::MethodReturn).is_err());
        reply.reply_serial = NonZeroU32::new(1);
        assert!(reply.check_required(Type::MethodReturn).is_ok());
        assert!(reply.check_required(Type::Error).is_err());
        reply.error_name = Some(ErrorName::try_from("org.example.Error").unwrap());
        assert!(reply.check_required(Type::Error).is_ok());
    }

    #[test]
    fn invalid_name_is_not_corruption() {
        let mut writer = Writer::new(Endian::Little);
        writer.write_bytes(&[0u8; 12]);
        let len_at = {
            writer.write_u32(0);
            writer.len() - 4
        };
        let start = writer.len();
        writer.align(8);
        writer.write_u8(FieldCode::Path as u8);
        writer.write_signature_str("o");
        writer.write_string("not-an-object-path");
        let array_len = (writer.len() - start) as u32;
        writer.patch_u32(len_at, array_len);
        let bytes = writer.into_bytes();

        let mut reader = Reader::new(&bytes, Endian::Little);
        for _ in 0..12 {
            reader.read_u8().unwrap();
        }
        assert!(matches!(
            Fields::read(&mut reader),
            Err(Error::InvalidName(_))
        ));
    }
}
