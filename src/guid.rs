use std::{fmt, str::FromStr};

use rand::Rng;

use crate::{Error, Result};

/// A D-Bus server GUID.
///
/// A universally-unique ID identifying one server endpoint, reported to
/// clients in the auth `OK` reply. Textually it is 32 lower-case hex digits
/// encoding 128 bits; the last 32 bits are a timestamp so GUIDs sort roughly
/// by creation time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Guid(String);

impl Guid {
    /// Generate a new random GUID.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let r0: u32 = rng.gen();
        let r1: u32 = rng.gen();
        let r2: u32 = rng.gen();
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        Self(format!("{r0:08x}{r1:08x}{r2:08x}{ts:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Address(format!("invalid GUID `{s}`")));
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<&str> for Guid {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owned alias kept for parity with the borrowing API of the name types.
pub type OwnedGuid = Guid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_well_formed() {
        let guid = Guid::generate();
        assert_eq!(guid.as_str().len(), 32);
        let reparsed: Guid = guid.as_str().parse().unwrap();
        assert_eq!(reparsed, guid);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Guid::from_str("deadbeef").is_err());
        assert!(Guid::from_str("zz6a64f96c3b4ae85c3b4ae85c3b4ae8").is_err());
        assert!(Guid::from_str("1234deadbeef1234deadbeef1234dead").is_ok());
    }
}
