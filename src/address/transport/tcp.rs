use std::collections::HashMap;

/// A TCP transport in a D-Bus address.
///
/// TCP carries no peer credentials, so EXTERNAL authentication is not
/// available over it; cookie authentication still works.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tcp {
    host: String,
    port: u16,
}

impl Tcp {
    /// Create a new TCP transport for the given host and port.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
        }
    }

    /// The host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port. May be `0` in a listen address, meaning a kernel-assigned
    /// port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub(super) fn from_options(opts: &HashMap<&str, String>) -> crate::Result<Self> {
        let host = opts
            .get("host")
            .ok_or_else(|| crate::Error::Address("tcp: address is missing `host`".to_owned()))?;
        let port = opts
            .get("port")
            .ok_or_else(|| crate::Error::Address("tcp: address is missing `port`".to_owned()))?;
        let port = port
            .parse()
            .map_err(|e| crate::Error::Address(format!("tcp: invalid port `{port}`: {e}")))?;

        Ok(Self::new(host, port))
    }
}
