//! Validated D-Bus name types.
//!
//! Every name arriving in a message header is checked against the character
//! classes of the specification before it is exposed; outbound messages can
//! therefore only be built from well-formed names.

use std::fmt;

use crate::{Error, Result};

const MAX_NAME_LENGTH: usize = 255;

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $validate:path) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                $validate(value)?;
                Ok(Self(value.to_owned()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                $validate(&value)?;
                Ok(Self(value))
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.try_into()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_type!(
    /// An object path: `/`, or `/`-separated nonempty elements of
    /// `[A-Za-z0-9_]`.
    ObjectPath,
    validate_object_path
);
name_type!(
    /// An interface name: two or more dot-separated elements, each starting
    /// with a letter or underscore.
    InterfaceName,
    validate_interface_name
);
name_type!(
    /// A member (method or signal) name: one undotted element.
    MemberName,
    validate_member_name
);
name_type!(
    /// An error name; structurally identical to an interface name.
    ErrorName,
    validate_interface_name
);
name_type!(
    /// A bus name: either unique (`:`-prefixed) or well-known.
    BusName,
    validate_bus_name
);
name_type!(
    /// A unique connection name assigned by a bus (`:`-prefixed).
    UniqueName,
    validate_unique_name
);

impl ObjectPath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_owned())
    }

    /// Whether `self` is `other` or a parent of it.
    ///
    /// Used for longest-prefix handler dispatch; `/` is a prefix of
    /// everything, `/foo` of `/foo` and `/foo/bar` but not of `/foobar`.
    pub fn is_prefix_of(&self, other: &ObjectPath) -> bool {
        if self.0 == "/" {
            return true;
        }
        match other.0.strip_prefix(&self.0) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

impl BusName {
    /// Whether this is a unique (`:`-prefixed) name.
    pub fn is_unique(&self) -> bool {
        self.0.starts_with(':')
    }
}

fn check_len(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::InvalidName(format!(
            "name exceeds {MAX_NAME_LENGTH} bytes"
        )));
    }
    Ok(())
}

fn validate_object_path(path: &str) -> Result<()> {
    let err = || Error::InvalidName(format!("invalid object path `{path}`"));

    if path.is_empty() || !path.starts_with('/') {
        return Err(err());
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(err());
    }
    for element in path[1..].split('/') {
        if element.is_empty()
            || !element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(err());
        }
    }

    Ok(())
}

fn element_ok(element: &str, allow_hyphen: bool, allow_leading_digit: bool) -> bool {
    let mut bytes = element.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    let first_ok = first.is_ascii_alphabetic()
        || first == b'_'
        || (allow_hyphen && first == b'-')
        || (allow_leading_digit && first.is_ascii_digit());
    first_ok
        && element[1..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || (allow_hyphen && b == b'-'))
}

fn validate_interface_name(name: &str) -> Result<()> {
    check_len(name)?;
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 || !elements.iter().all(|e| element_ok(e, false, false)) {
        return Err(Error::InvalidName(format!(
            "invalid interface name `{name}`"
        )));
    }
    Ok(())
}

fn validate_member_name(name: &str) -> Result<()> {
    check_len(name)?;
    if !element_ok(name, false, false) {
        return Err(Error::InvalidName(format!("invalid member name `{name}`")));
    }
    Ok(())
}

fn validate_unique_name(name: &str) -> Result<()> {
    check_len(name)?;
    let Some(rest) = name.strip_prefix(':') else {
        return Err(Error::InvalidName(format!("invalid unique name `{name}`")));
    };
    let elements: Vec<&str> = rest.split('.').collect();
    if elements.len() < 2 || !elements.iter().all(|e| element_ok(e, true, true)) {
        return Err(Error::InvalidName(format!("invalid unique name `{name}`")));
    }
    Ok(())
}

fn validate_bus_name(name: &str) -> Result<()> {
    if name.starts_with(':') {
        return validate_unique_name(name);
    }
    check_len(name)?;
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 || !elements.iter().all(|e| element_ok(e, true, false)) {
        return Err(Error::InvalidName(format!("invalid bus name `{name}`")));
    }
    Ok(())
}

/// A validated D-Bus type signature.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Signature(String);

/// Nesting limits from the wire format: arrays and structs may each nest 32
/// levels deep.
const MAX_NESTING: usize = 32;

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        validate_signature(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        validate_signature(&value)?;
        Ok(Self(value))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn validate_signature(sig: &str) -> Result<()> {
    let bytes = sig.as_bytes();
    if bytes.len() > MAX_NAME_LENGTH {
        return Err(Error::InvalidName("signature exceeds 255 bytes".into()));
    }

    let mut pos = 0;
    while pos < bytes.len() {
        pos = validate_single_type(bytes, pos, 0, 0)
            .ok_or_else(|| Error::InvalidName(format!("invalid signature `{sig}`")))?;
    }

    Ok(())
}

/// Validate one complete type starting at `pos`; returns the position past it.
fn validate_single_type(
    bytes: &[u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
) -> Option<usize> {
    match *bytes.get(pos)? {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b'h' | b's' | b'o'
        | b'g' | b'v' => Some(pos + 1),
        b'a' => {
            if array_depth + 1 > MAX_NESTING {
                return None;
            }
            if bytes.get(pos + 1) == Some(&b'{') {
                // Dict entries exist only as array elements.
                let key = pos + 2;
                let key_end = match *bytes.get(key)? {
                    b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b'h'
                    | b's' | b'o' | b'g' => key + 1,
                    _ => return None,
                };
                let value_end =
                    validate_single_type(bytes, key_end, array_depth + 1, struct_depth)?;
                if bytes.get(value_end) != Some(&b'}') {
                    return None;
                }
                Some(value_end + 1)
            } else {
                validate_single_type(bytes, pos + 1, array_depth + 1, struct_depth)
            }
        }
        b'(' => {
            if struct_depth + 1 > MAX_NESTING {
                return None;
            }
            let mut inner = pos + 1;
            if bytes.get(inner) == Some(&b')') {
                // Empty structs are not allowed.
                return None;
            }
            while bytes.get(inner) != Some(&b')') {
                inner = validate_single_type(bytes, inner, array_depth, struct_depth + 1)?;
            }
            Some(inner + 1)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths() {
        for ok in ["/", "/org", "/org/freedesktop/DBus", "/a/b_c/D9"] {
            assert!(ObjectPath::try_from(ok).is_ok(), "{ok}");
        }
        for bad in ["", "org", "/org/", "//", "/org//x", "/with-dash", "/ö"] {
            assert!(ObjectPath::try_from(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn prefix_matching() {
        let root = ObjectPath::root();
        let foo = ObjectPath::try_from("/foo").unwrap();
        let foobar = ObjectPath::try_from("/foo/bar").unwrap();
        let foobaz = ObjectPath::try_from("/foobaz").unwrap();

        assert!(root.is_prefix_of(&foobar));
        assert!(foo.is_prefix_of(&foo));
        assert!(foo.is_prefix_of(&foobar));
        assert!(!foo.is_prefix_of(&foobaz));
        assert!(!foobar.is_prefix_of(&foo));
    }

    #[test]
    fn interface_names() {
        assert!(InterfaceName::try_from("org.freedesktop.DBus").is_ok());
        assert!(InterfaceName::try_from("a.b").is_ok());
        assert!(InterfaceName::try_from("_a._9b").is_ok());
        assert!(InterfaceName::try_from("single").is_err());
        assert!(InterfaceName::try_from("a..b").is_err());
        assert!(InterfaceName::try_from("a.9b").is_err());
        assert!(InterfaceName::try_from(".a.b").is_err());
    }

    #[test]
    fn member_names() {
        assert!(MemberName::try_from("Hello").is_ok());
        assert!(MemberName::try_from("_priv9").is_ok());
        assert!(MemberName::try_from("has.dot").is_err());
        assert!(MemberName::try_from("9starts").is_err());
        assert!(MemberName::try_from("").is_err());
    }

    #[test]
    fn bus_names() {
        assert!(BusName::try_from("org.freedesktop.DBus").is_ok());
        assert!(BusName::try_from("com.example-corp.App").is_ok());
        assert!(BusName::try_from(":1.42").is_ok());
        assert!(BusName::try_from("org").is_err());
        assert!(BusName::try_from("org.9x").is_err());

        assert!(UniqueName::try_from(":1.42").is_ok());
        assert!(UniqueName::try_from("org.freedesktop.DBus").is_err());
    }

    #[test]
    fn signatures() {
        for ok in [
            "",
            "s",
            "a{sv}",
            "(ii)",
            "a(yv)",
            "aas",
            "v",
            "a{s(iu)}",
            "ybnqiuxtdsogh",
        ] {
            assert!(validate_signature(ok).is_ok(), "{ok}");
        }
        for bad in ["z", "a", "()", "(s", "a{vs}", "a{s}", "{sv}", "a{(i)s}"] {
            assert!(validate_signature(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn signature_nesting_limit() {
        let deep_ok = "a".repeat(32) + "u";
        assert!(validate_signature(&deep_ok).is_ok());
        let deep_bad = "a".repeat(33) + "u";
        assert!(validate_signature(&deep_bad).is_err());
    }

    #[test]
    fn signature_length_limit() {
        let long = "i".repeat(255);
        assert!(validate_signature(&long).is_ok());
        let too_long = "i".repeat(256);
        assert!(validate_signature(&too_long).is_err());
    }
}
