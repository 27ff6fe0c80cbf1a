/// The message header-field code.
///
/// Every header field is tagged on the wire with one of these codes. This is
/// mostly an internal D-Bus protocol detail; unknown codes received from a
/// peer are skipped for forward compatibility.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FieldCode {
    /// The object to send a call to, or the object a signal is emitted from.
    Path = 1,
    /// The interface to invoke a method call on, or that a signal is emitted
    /// from.
    Interface = 2,
    /// The member, either the method name or signal name.
    Member = 3,
    /// The name of the error that occurred, for errors.
    ErrorName = 4,
    /// The serial number of the message this message is a reply to.
    ReplySerial = 5,
    /// The name of the connection this message is intended for.
    Destination = 6,
    /// Unique name of the sending connection.
    Sender = 7,
    /// The signature of the message body.
    Signature = 8,
    /// The number of Unix file descriptors that accompany the message.
    UnixFDs = 9,
}

impl FieldCode {
    /// Map a wire byte onto a known code; `None` for codes we skip.
    pub fn from_byte(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Path),
            2 => Some(Self::Interface),
            3 => Some(Self::Member),
            4 => Some(Self::ErrorName),
            5 => Some(Self::ReplySerial),
            6 => Some(Self::Destination),
            7 => Some(Self::Sender),
            8 => Some(Self::Signature),
            9 => Some(Self::UnixFDs),
            _ => None,
        }
    }
}
