//! D-Bus address handling.
//!
//! Server addresses consist of a transport name followed by a colon, and
//! then an optional, comma-separated list of keys and values in the form
//! key=value. Multiple addresses separated by `;` form a fallback list tried
//! in order.
//!
//! See also:
//!
//! * [Server addresses] in the D-Bus specification.
//!
//! [Server addresses]: https://dbus.freedesktop.org/doc/dbus-specification.html#addresses

pub mod transport;

use crate::{Error, Guid, OwnedGuid, Result};
use std::{collections::HashMap, env, fmt::Write, str::FromStr};

pub use self::transport::Transport;
pub(crate) use self::transport::Stream;

/// Bytes that may appear unescaped in an address value.
fn is_optionally_escaped(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'.' | b'\\' | b'*' | b'@')
}

/// Percent-encode an address value.
pub(crate) fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if is_optionally_escaped(b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02x}");
        }
    }
    out
}

/// Decode a percent-encoded address value.
pub(crate) fn unescape_value(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::Address(format!("truncated escape in `{value}`")))?;
                let hex = std::str::from_utf8(hex)
                    .map_err(|_| Error::Address(format!("invalid escape in `{value}`")))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::Address(format!("invalid escape in `{value}`")))?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| Error::Address(format!("non-UTF-8 value in `{value}`")))
}

/// A bus address.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Address {
    guid: Option<OwnedGuid>,
    transport: Transport,
}

impl Address {
    /// Create a new `Address` from a `Transport`.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            guid: None,
        }
    }

    /// Set the GUID for this address.
    pub fn set_guid<G>(mut self, guid: G) -> Result<Self>
    where
        G: TryInto<OwnedGuid>,
        G::Error: Into<crate::Error>,
    {
        self.guid = Some(guid.try_into().map_err(Into::into)?);

        Ok(self)
    }

    /// The transport details for this address.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn connect(self) -> Result<Stream> {
        self.transport.connect()
    }

    /// Get the address for the session socket respecting the
    /// DBUS_SESSION_BUS_ADDRESS environment variable. If we don't recognize
    /// the value (or it's not set) we fall back to $XDG_RUNTIME_DIR/bus.
    pub fn session() -> Result<Self> {
        match env::var("DBUS_SESSION_BUS_ADDRESS") {
            Ok(val) => Self::from_str(&val),
            _ => {
                let id = unsafe { libc::geteuid() }.to_string();
                let runtime_dir =
                    env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| format!("/run/user/{}", id));
                let path = format!("unix:path={runtime_dir}/bus");

                Self::from_str(&path)
            }
        }
    }

    /// Get the address for the system bus respecting the
    /// DBUS_SYSTEM_BUS_ADDRESS environment variable. If we don't recognize
    /// the value (or it's not set) we fall back to
    /// /var/run/dbus/system_bus_socket.
    pub fn system() -> Result<Self> {
        match env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            Ok(val) => Self::from_str(&val),
            _ => Self::from_str("unix:path=/var/run/dbus/system_bus_socket"),
        }
    }

    /// The GUID for this address, if known.
    pub fn guid(&self) -> Option<&Guid> {
        self.guid.as_ref()
    }

    /// Parse a `;`-separated fallback list of addresses.
    ///
    /// The first entry that fails to parse fails the whole list; an empty
    /// list is an error.
    pub fn parse_list(addresses: &str) -> Result<Vec<Address>> {
        let list: Vec<Address> = addresses
            .split(';')
            .filter(|entry| !entry.is_empty())
            .map(Self::from_str)
            .collect::<Result<_>>()?;

        if list.is_empty() {
            return Err(Error::Address("empty address list".to_owned()));
        }

        Ok(list)
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse one D-Bus address entry.
    fn from_str(address: &str) -> Result<Self> {
        let col = address
            .find(':')
            .ok_or_else(|| Error::Address("address has no colon".to_owned()))?;
        let transport = &address[..col];
        let mut options = HashMap::new();

        if address.len() > col + 1 {
            for kv in address[col + 1..].split(',') {
                let (k, v) = match kv.find('=') {
                    Some(eq) => (&kv[..eq], unescape_value(&kv[eq + 1..])?),
                    None => {
                        return Err(Error::Address(
                            "missing = when parsing key/value".to_owned(),
                        ))
                    }
                };
                if options.insert(k, v).is_some() {
                    return Err(Error::Address(format!(
                        "Key `{k}` specified multiple times"
                    )));
                }
            }
        }

        Ok(Self {
            guid: options
                .remove("guid")
                .map(|s| Guid::from_str(&s))
                .transpose()?,
            transport: Transport::from_options(transport, &options)?,
        })
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_str(value)
    }
}

impl From<Transport> for Address {
    fn from(transport: Transport) -> Self {
        Self::new(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::{transport::UnixSocket, *};

    #[test]
    fn parse_unix_path() {
        let addr = Address::from_str("unix:path=/tmp/bus").unwrap();
        match addr.transport() {
            Transport::Unix(u) => {
                assert_eq!(u.path(), &UnixSocket::File("/tmp/bus".into()));
            }
            other => panic!("wrong transport: {other:?}"),
        }
    }

    #[test]
    fn parse_tcp() {
        let addr = Address::from_str("tcp:host=127.0.0.1,port=4242").unwrap();
        match addr.transport() {
            Transport::Tcp(t) => {
                assert_eq!(t.host(), "127.0.0.1");
                assert_eq!(t.port(), 4242);
            }
            other => panic!("wrong transport: {other:?}"),
        }

        assert!(Address::from_str("tcp:host=x,port=notaport").is_err());
        assert!(Address::from_str("tcp:port=1").is_err());
    }

    #[test]
    fn parse_guid_option() {
        let addr =
            Address::from_str("unix:path=/tmp/bus,guid=1234deadbeef1234deadbeef1234dead").unwrap();
        assert_eq!(
            addr.guid().map(|g| g.as_str()),
            Some("1234deadbeef1234deadbeef1234dead")
        );

        assert!(Address::from_str("unix:path=/tmp/bus,guid=xyz").is_err());
    }

    #[test]
    fn parse_errors() {
        assert!(Address::from_str("nocolon").is_err());
        assert!(Address::from_str("unix:path=/a,path=/b").is_err());
        assert!(Address::from_str("unix:key").is_err());
        assert!(Address::from_str("sctp:host=x").is_err());
        assert!(Address::from_str("unix:path=/a,abstract=b").is_err());
    }

    #[test]
    fn fallback_lists() {
        let list =
            Address::parse_list("unix:path=/tmp/a;tcp:host=localhost,port=17").unwrap();
        assert_eq!(list.len(), 2);
        assert!(Address::parse_list("").is_err());
        assert!(Address::parse_list("unix:path=/a;bogus").is_err());
    }

    #[test]
    fn value_escaping() {
        assert_eq!(escape_value("/tmp/a b"), "/tmp/a%20b");
        assert_eq!(unescape_value("/tmp/a%20b").unwrap(), "/tmp/a b");
        assert_eq!(unescape_value(&escape_value("100% tmp")).unwrap(), "100% tmp");
        assert!(unescape_value("%2").is_err());
        assert!(unescape_value("%zz").is_err());

        let addr = Address::from_str("unix:path=/tmp/with%20space").unwrap();
        match addr.transport() {
            Transport::Unix(u) => {
                assert_eq!(u.path(), &UnixSocket::File("/tmp/with space".into()));
            }
            other => panic!("wrong transport: {other:?}"),
        }
    }
}
