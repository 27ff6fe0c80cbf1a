//! Blocking handshake drivers.
//!
//! These pump the byte-driven [`Auth`] engine over a socket: the client
//! driver performs the nul-byte credential exchange and authenticates
//! against a server; the server driver consumes the credential byte,
//! records the peer's identity and runs the server side of the exchange.
//! Both produce an [`Authenticated`] carrying the socket halves and any
//! bytes the peer pipelined past the auth boundary.

use std::path::PathBuf;

use log::trace;

use crate::{
    credentials::Credentials,
    guid::OwnedGuid,
    Error, Result,
};

use super::auth::{Auth, AuthMechanism, DataCodec};
use super::socket::{BoxedSplit, ReadHalf, WriteHalf};

/// Read granularity during the handshake. Auth lines are short; reading in
/// small chunks keeps pipelined framed bytes out of our buffer where
/// possible (they are handed over either way).
const HANDSHAKE_READ_CHUNK: usize = 64;

/// The result of a finalized handshake.
///
/// The result of a finalized [`ClientHandshake`] or [`ServerHandshake`]. It
/// can be passed to `Connection::new_authenticated` to initialize a
/// connection.
pub struct Authenticated {
    pub(crate) socket_read: Box<dyn ReadHalf>,
    pub(crate) socket_write: Box<dyn WriteHalf>,
    /// The server's GUID: generated locally for the server role, learned
    /// from `OK` for the client role.
    pub(crate) server_guid: OwnedGuid,
    /// The peer's transport credentials (server role; empty for clients).
    pub(crate) credentials: Credentials,
    /// Whether file descriptor passing is available on this transport.
    pub(crate) cap_unix_fd: bool,
    /// Bytes already received past the auth boundary.
    pub(crate) already_received_bytes: Vec<u8>,
    /// Security-layer transforms installed by the mechanism, if any.
    pub(crate) codecs: (Option<DataCodec>, Option<DataCodec>),
}

impl std::fmt::Debug for Authenticated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticated")
            .field("server_guid", &self.server_guid)
            .field("credentials", &self.credentials)
            .field("cap_unix_fd", &self.cap_unix_fd)
            .finish()
    }
}

impl Authenticated {
    /// Run a client handshake on `socket` to completion.
    pub fn client(
        socket: BoxedSplit,
        server_guid: Option<OwnedGuid>,
        mechanisms: Option<Vec<AuthMechanism>>,
    ) -> Result<Self> {
        ClientHandshake::new(socket, mechanisms, server_guid)?.perform()
    }

    /// Run a server handshake on an accepted `socket` to completion.
    pub fn server(
        socket: BoxedSplit,
        guid: OwnedGuid,
        mechanisms: Option<Vec<AuthMechanism>>,
    ) -> Result<Self> {
        ServerHandshake::new(socket, guid, mechanisms).perform()
    }

    /// The peer credentials recorded during the credential exchange.
    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// The server GUID for this connection.
    pub fn server_guid(&self) -> &OwnedGuid {
        &self.server_guid
    }
}

/// Common socket pump for both roles.
///
/// Writes everything the engine queued, then reads one chunk and feeds it
/// back, until the engine reports completion or a protocol violation.
fn pump(socket: &mut BoxedSplit, auth: &mut Auth) -> Result<()> {
    loop {
        while !auth.outgoing().is_empty() {
            let written = socket.write_mut().sendmsg(auth.outgoing(), &[])?;
            auth.consume_outgoing(written);
        }

        if auth.authenticated() {
            return Ok(());
        }
        if auth.needs_disconnect() {
            return Err(Error::Handshake("authentication failed".into()));
        }

        let mut buf = [0; HANDSHAKE_READ_CHUNK];
        let (read, fds) = socket.read_mut().recvmsg(&mut buf)?;
        if !fds.is_empty() {
            return Err(Error::Handshake("Unexpected FDs during handshake".into()));
        }
        if read == 0 {
            return Err(Error::Handshake("Unexpected EOF during handshake".into()));
        }
        auth.handle_input(&buf[..read])?;
    }
}

/// A representation of an in-progress handshake, client-side.
///
/// Call [`ClientHandshake::perform`] to drive it to completion on the
/// calling thread; the socket should be in blocking mode.
#[derive(Debug)]
pub struct ClientHandshake {
    socket: BoxedSplit,
    auth: Auth,
}

impl ClientHandshake {
    /// Start a handshake on this client socket.
    pub fn new(
        socket: BoxedSplit,
        mechanisms: Option<Vec<AuthMechanism>>,
        server_guid: Option<OwnedGuid>,
    ) -> Result<ClientHandshake> {
        Ok(ClientHandshake {
            socket,
            auth: Auth::client(mechanisms, server_guid)?,
        })
    }

    /// Redirect cookie keyring storage, for tests and sandboxes.
    pub fn set_keyring_directory(&mut self, directory: PathBuf) {
        self.auth.set_keyring_directory(directory);
    }

    /// Perform the handshake.
    ///
    /// On a successful handshake, you get an `Authenticated`. If you need to
    /// send a bus Hello, that remains to be done.
    pub fn perform(mut self) -> Result<Authenticated> {
        trace!("starting client handshake");

        // The nul credential byte precedes any auth line. The dbus daemon on
        // some platforms requires sending it as a separate message with
        // SCM_CREDS.
        #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
        let written = self
            .socket
            .write_mut()
            .send_zero_byte()
            .map_err(|e| {
                Error::Handshake(format!("Could not send zero byte with credentials: {}", e))
            })
            .and_then(|n| {
                n.ok_or_else(|| {
                    Error::Handshake("Could not send zero byte with credentials".to_string())
                })
            })?;

        #[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
        let written = self.socket.write_mut().sendmsg(&[b'\0'], &[])?;

        if written != 1 {
            return Err(Error::Handshake(
                "Could not send zero byte with credentials".to_string(),
            ));
        }

        pump(&mut self.socket, &mut self.auth)?;

        let server_guid = self
            .auth
            .server_guid()
            .cloned()
            .ok_or_else(|| Error::Handshake("Handshake done without a server GUID".into()))?;
        let codecs = self.auth.take_data_codecs();
        let cap_unix_fd = self.socket.read_mut().can_pass_unix_fd();
        let already_received_bytes = self.auth.take_unused_bytes();
        let (socket_read, socket_write) = self.socket.take();

        trace!("client handshake done");
        Ok(Authenticated {
            socket_read,
            socket_write,
            server_guid,
            credentials: Credentials::empty(),
            cap_unix_fd,
            already_received_bytes,
            codecs,
        })
    }
}

/// A representation of an in-progress handshake, server-side.
#[derive(Debug)]
pub struct ServerHandshake {
    socket: BoxedSplit,
    guid: OwnedGuid,
    mechanisms: Option<Vec<AuthMechanism>>,
    keyring_directory: Option<PathBuf>,
}

impl ServerHandshake {
    /// Start a handshake on this accepted socket.
    pub fn new(
        socket: BoxedSplit,
        guid: OwnedGuid,
        mechanisms: Option<Vec<AuthMechanism>>,
    ) -> ServerHandshake {
        ServerHandshake {
            socket,
            guid,
            mechanisms,
            keyring_directory: None,
        }
    }

    /// Redirect cookie keyring storage, for tests and sandboxes.
    pub fn set_keyring_directory(&mut self, directory: PathBuf) {
        self.keyring_directory = Some(directory);
    }

    /// Perform the handshake.
    pub fn perform(mut self) -> Result<Authenticated> {
        trace!("starting server handshake");

        // Consume exactly the one nul byte every client leads with, and
        // record the peer credentials it carries.
        let mut nul = [0u8; 1];
        let (read, fds) = self.socket.read_mut().recvmsg(&mut nul)?;
        if read != 1 || nul[0] != b'\0' {
            return Err(Error::Handshake(
                "client did not send the credential nul byte".into(),
            ));
        }
        if !fds.is_empty() {
            return Err(Error::Handshake("Unexpected FDs during handshake".into()));
        }
        let credentials = self
            .socket
            .read_mut()
            .peer_credentials()
            .unwrap_or_else(|_| Credentials::empty());
        trace!("peer credentials: {credentials:?}");

        let mut auth = Auth::server(self.guid.clone(), credentials, self.mechanisms.clone());
        if let Some(dir) = &self.keyring_directory {
            auth.set_keyring_directory(dir.clone());
        }

        pump(&mut self.socket, &mut auth)?;

        let codecs = auth.take_data_codecs();
        let cap_unix_fd = self.socket.read_mut().can_pass_unix_fd();
        let already_received_bytes = auth.take_unused_bytes();
        let (socket_read, socket_write) = self.socket.take();

        trace!("server handshake done");
        Ok(Authenticated {
            socket_read,
            socket_write,
            server_guid: self.guid,
            credentials,
            cap_unix_fd,
            already_received_bytes,
            codecs,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn external_handshake_over_socketpair() {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        let guid = OwnedGuid::generate();

        let server_guid = guid.clone();
        let server = std::thread::spawn(move || {
            Authenticated::server(server_stream.into(), server_guid, None)
        });

        let client = Authenticated::client(client_stream.into(), None, None).unwrap();
        let server = server.join().unwrap().unwrap();

        assert_eq!(client.server_guid(), &guid);
        assert_eq!(
            server.credentials().unix_user_id(),
            Some(unsafe { libc::geteuid() } as u32)
        );
        assert!(client.already_received_bytes.is_empty());
    }

    #[test]
    fn expected_guid_mismatch_fails() {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();

        let server = std::thread::spawn(move || {
            Authenticated::server(server_stream.into(), OwnedGuid::generate(), None)
        });

        let expected = OwnedGuid::generate();
        let result = Authenticated::client(client_stream.into(), Some(expected), None);
        assert!(result.is_err());
        // The server half errors out too (EOF or protocol error).
        let _ = server.join().unwrap();
    }

    #[test]
    fn pipelined_message_bytes_survive_the_handshake() {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        let guid = OwnedGuid::generate();

        let server = std::thread::spawn(move || {
            Authenticated::server(server_stream.into(), guid, None)
        });

        // Drive the client manually so BEGIN and framed bytes share a write.
        let uid = unsafe { libc::geteuid() }.to_string();
        let auth_line = format!("AUTH EXTERNAL {}\r\n", hex::encode(uid.as_bytes()));
        use std::io::{Read, Write};
        let mut stream = client_stream;
        stream.write_all(b"\0").unwrap();
        stream.write_all(auth_line.as_bytes()).unwrap();
        let mut reply = [0u8; 64];
        let n = stream.read(&mut reply).unwrap();
        assert!(std::str::from_utf8(&reply[..n]).unwrap().starts_with("OK "));
        stream.write_all(b"BEGIN\r\nl\x01\x02\x03").unwrap();

        let server = server.join().unwrap().unwrap();
        assert_eq!(server.already_received_bytes, b"l\x01\x02\x03");
    }
}
