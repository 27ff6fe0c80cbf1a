//! The authentication engine.
//!
//! A byte-driven state machine for the line-oriented auth protocol that runs
//! before any framed message flows. The transport (or the blocking handshake
//! driver) feeds received bytes in through [`Auth::handle_input`] and drains
//! [`Auth::outgoing`] to the socket; the engine never touches the socket
//! itself, which also makes it drivable from tests without one.

use std::{collections::VecDeque, fmt, path::PathBuf, str::FromStr};

use log::{trace, warn};

use crate::{
    bytebuf::{base64_decode, base64_encode, hex_decode, hex_encode, ByteBuf, Secret},
    credentials::Credentials,
    guid::OwnedGuid,
    keyring::{self, Keyring},
    sha1::{constant_time_eq, random_challenge_hex, sha1_hex},
    userdb, Error, Result,
};

/// Cap on each of the incoming and outgoing auth buffers. A peer that
/// produces more auth chatter than this is broken or malicious.
const MAX_AUTH_BUFFER: usize = 16 * 1024;

/// Rejections tolerated before the server hangs up. Kept as state rather
/// than a constant so a per-mechanism policy can replace it.
const MAX_FAILURES: u32 = 6;

/// The default cookie context.
const DEFAULT_COOKIE_CONTEXT: &str = "org_freedesktop_general";

/// Authentication mechanisms
///
/// See <https://dbus.freedesktop.org/doc/dbus-specification.html#auth-mechanisms>
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMechanism {
    /// This is the recommended authentication mechanism on platforms where
    /// credentials can be transferred out-of-band, in particular Unix
    /// platforms that can perform credentials-passing over the `unix:`
    /// transport.
    External,

    /// This mechanism is designed to establish that a client has the ability
    /// to read a private file owned by the user being authenticated.
    Cookie,
}

impl AuthMechanism {
    /// All mechanisms, in preference order.
    pub fn all() -> &'static [AuthMechanism] {
        &[AuthMechanism::External, AuthMechanism::Cookie]
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mech = match self {
            AuthMechanism::External => "EXTERNAL",
            AuthMechanism::Cookie => "DBUS_COOKIE_SHA1",
        };
        write!(f, "{mech}")
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL" => Ok(AuthMechanism::External),
            "DBUS_COOKIE_SHA1" => Ok(AuthMechanism::Cookie),
            _ => Err(Error::Handshake(format!("Unknown mechanism: {s}"))),
        }
    }
}

// The SASL-profile authentication protocol described here:
// <https://dbus.freedesktop.org/doc/dbus-specification.html#auth-protocol>
//
// These are all the known commands, which can be parsed from or serialized
// to text. `AUTH` initial responses travel hex-encoded; `DATA` payloads
// travel base64-encoded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Auth(Option<String>, Option<Vec<u8>>),
    Cancel,
    Begin,
    Data(Option<Vec<u8>>),
    Error(String),
    Rejected(Vec<String>),
    Ok(OwnedGuid),
    /// Anything with an unrecognized verb; answered with an error, never a
    /// disconnect.
    Unknown(String),
}

impl From<Command> for Vec<u8> {
    fn from(c: Command) -> Self {
        c.to_string().into()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Auth(mech, resp) => match (mech, resp) {
                (Some(mech), Some(resp)) => write!(f, "AUTH {mech} {}", hex_encode(resp)),
                (Some(mech), None) => write!(f, "AUTH {mech}"),
                _ => write!(f, "AUTH"),
            },
            Command::Cancel => write!(f, "CANCEL"),
            Command::Begin => write!(f, "BEGIN"),
            Command::Data(data) => match data {
                None => write!(f, "DATA"),
                Some(data) => write!(f, "DATA {}", base64_encode(data)),
            },
            Command::Error(expl) if expl.is_empty() => write!(f, "ERROR"),
            Command::Error(expl) => write!(f, "ERROR \"{expl}\""),
            Command::Rejected(mechs) => {
                write!(f, "REJECTED {}", mechs.join(" "))
            }
            Command::Ok(guid) => write!(f, "OK {guid}"),
            Command::Unknown(verb) => write!(f, "{verb}"),
        }?;
        write!(f, "\r\n")
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_ascii_whitespace();
        let cmd = match words.next() {
            Some("AUTH") => {
                let mech = words.next().map(str::to_owned);
                let resp = match words.next() {
                    Some(resp) => Some(hex_decode(resp)?),
                    None => None,
                };
                Command::Auth(mech, resp)
            }
            Some("CANCEL") => Command::Cancel,
            Some("BEGIN") => Command::Begin,
            Some("DATA") => {
                let data = match words.next() {
                    Some(data) => Some(base64_decode(data)?),
                    None => None,
                };

                Command::Data(data)
            }
            Some("ERROR") => Command::Error(s["ERROR".len()..].trim().to_owned()),
            Some("REJECTED") => {
                let mechs = words.map(str::to_owned).collect();
                Command::Rejected(mechs)
            }
            Some("OK") => {
                let guid = words
                    .next()
                    .ok_or_else(|| Error::Handshake("Missing OK server GUID!".into()))?;
                Command::Ok(OwnedGuid::from_str(guid).map_err(|_| {
                    Error::Handshake(format!("Invalid server GUID `{guid}`"))
                })?)
            }
            Some(other) => Command::Unknown(other.to_owned()),
            None => Command::Unknown(String::new()),
        };
        Ok(cmd)
    }
}

/// Client progress through the exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientState {
    /// A cookie challenge is expected next.
    WaitingForData,
    /// `OK` (or a rejection) is expected next.
    WaitingForOk,
    /// A `REJECTED` is expected after our `CANCEL`/`ERROR`.
    WaitingForReject,
    /// `BEGIN` sent; authenticated once the output drains.
    Done,
}

/// Server progress through the exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServerState {
    WaitingForAuth,
    WaitingForData,
    WaitingForBegin,
}

#[derive(Debug)]
enum Side {
    Client {
        state: ClientState,
        mechs_to_try: VecDeque<AuthMechanism>,
        current_mech: Option<AuthMechanism>,
        already_got_mechanisms: bool,
        expected_guid: Option<OwnedGuid>,
        server_guid: Option<OwnedGuid>,
    },
    Server {
        state: ServerState,
        guid: OwnedGuid,
        mech: Option<AuthMechanism>,
        failures: u32,
        max_failures: u32,
        client_credentials: Credentials,
        authorized_identity: Credentials,
        already_asked_for_initial_response: bool,
        cookie: ServerCookie,
    },
}

/// Server-side state of an in-flight cookie exchange.
#[derive(Debug, Default)]
struct ServerCookie {
    cookie_id: Option<u64>,
    challenge_hex: String,
    keyring: Option<Keyring>,
}

impl ServerCookie {
    fn reset(&mut self) {
        self.cookie_id = None;
        self.challenge_hex.clear();
        self.keyring = None;
    }
}

/// Post-auth byte transform installed by a mechanism.
///
/// Applied to every chunk in the corresponding direction once the connection
/// switches to framed mode. Neither built-in mechanism installs one; the
/// plumbing exists for future SASL security layers.
pub type DataCodec = Box<dyn Fn(&[u8]) -> Vec<u8> + Send>;

/// The authentication engine for one connection, either role.
pub struct Auth {
    side: Side,
    incoming: ByteBuf,
    outgoing: ByteBuf,
    authenticated: bool,
    authenticated_pending_output: bool,
    need_disconnect: bool,
    unused_bytes: Vec<u8>,
    allowed_mechanisms: Option<Vec<AuthMechanism>>,
    encode_data: Option<DataCodec>,
    decode_data: Option<DataCodec>,
    /// Keyring location override, for tests and sandboxed deployments.
    keyring_directory: Option<PathBuf>,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("side", &self.side)
            .field("authenticated", &self.authenticated)
            .field("need_disconnect", &self.need_disconnect)
            .finish()
    }
}

impl Auth {
    /// Create a client engine. The opening `AUTH` line for the most
    /// preferred mechanism is queued immediately.
    pub fn client(
        mechanisms: Option<Vec<AuthMechanism>>,
        expected_guid: Option<OwnedGuid>,
    ) -> Result<Auth> {
        let mechs_to_try: VecDeque<AuthMechanism> = mechanisms
            .clone()
            .unwrap_or_else(|| AuthMechanism::all().to_vec())
            .into();

        let mut auth = Auth {
            side: Side::Client {
                state: ClientState::WaitingForOk,
                mechs_to_try,
                current_mech: None,
                already_got_mechanisms: false,
                expected_guid,
                server_guid: None,
            },
            incoming: ByteBuf::new(),
            outgoing: ByteBuf::new(),
            authenticated: false,
            authenticated_pending_output: false,
            need_disconnect: false,
            unused_bytes: Vec::new(),
            allowed_mechanisms: mechanisms,
            encode_data: None,
            decode_data: None,
            keyring_directory: None,
        };

        if !auth.client_try_next_mechanism()? {
            return Err(Error::Handshake("no auth mechanisms available".into()));
        }

        Ok(auth)
    }

    /// Create a server engine for a connection whose transport reported
    /// `client_credentials`.
    pub fn server(
        guid: OwnedGuid,
        client_credentials: Credentials,
        allowed_mechanisms: Option<Vec<AuthMechanism>>,
    ) -> Auth {
        Auth {
            side: Side::Server {
                state: ServerState::WaitingForAuth,
                guid,
                mech: None,
                failures: 0,
                max_failures: MAX_FAILURES,
                client_credentials,
                authorized_identity: Credentials::empty(),
                already_asked_for_initial_response: false,
                cookie: ServerCookie::default(),
            },
            incoming: ByteBuf::new(),
            outgoing: ByteBuf::new(),
            authenticated: false,
            authenticated_pending_output: false,
            need_disconnect: false,
            unused_bytes: Vec::new(),
            allowed_mechanisms,
            encode_data: None,
            decode_data: None,
            keyring_directory: None,
        }
    }

    /// Redirect keyring storage away from `$HOME/.dbus-keyrings`.
    pub fn set_keyring_directory(&mut self, directory: PathBuf) {
        self.keyring_directory = Some(directory);
    }

    /// Whether the handshake has fully completed on this side.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether the peer violated the protocol and must be dropped.
    pub fn needs_disconnect(&self) -> bool {
        self.need_disconnect
    }

    /// Bytes waiting to be written to the peer.
    pub fn outgoing(&self) -> &[u8] {
        self.outgoing.as_slice()
    }

    /// Drop `n` outgoing bytes that the transport wrote out.
    ///
    /// On the client, draining the buffer after `BEGIN` completes the
    /// handshake.
    pub fn consume_outgoing(&mut self, n: usize) {
        self.outgoing.drain_front(n);
        if self.authenticated_pending_output && self.outgoing.is_empty() {
            self.authenticated_pending_output = false;
            self.authenticated = true;
            self.surrender_incoming();
        }
    }

    /// Bytes that arrived past the auth boundary; the first bytes of the
    /// framed stream. Pipelining peers make this nonempty.
    pub fn take_unused_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.unused_bytes)
    }

    /// The server GUID: ours (server role) or the peer's from `OK` (client).
    pub fn server_guid(&self) -> Option<&OwnedGuid> {
        match &self.side {
            Side::Client { server_guid, .. } => server_guid.as_ref(),
            Side::Server { guid, .. } => Some(guid),
        }
    }

    /// The identity the server authorized, once authenticated.
    pub fn authorized_identity(&self) -> Credentials {
        match &self.side {
            Side::Client { .. } => Credentials::from_current_process(),
            Side::Server {
                authorized_identity,
                ..
            } => *authorized_identity,
        }
    }

    /// Take the post-auth byte transforms, if the mechanism installed any.
    pub fn take_data_codecs(&mut self) -> (Option<DataCodec>, Option<DataCodec>) {
        (self.encode_data.take(), self.decode_data.take())
    }

    /// Feed received bytes and run the state machine.
    pub fn handle_input(&mut self, bytes: &[u8]) -> Result<()> {
        if self.authenticated {
            // Post-auth bytes belong to the message stream.
            self.unused_bytes.extend_from_slice(bytes);
            return Ok(());
        }

        self.incoming.extend_from_slice(bytes);
        if self.incoming.len() > MAX_AUTH_BUFFER || self.outgoing.len() > MAX_AUTH_BUFFER {
            warn!("auth buffer overflow; disconnecting");
            self.need_disconnect = true;
            return Err(Error::Handshake("auth buffer overflow".into()));
        }

        while !self.authenticated && !self.need_disconnect {
            let Some(line) = self.incoming.take_crlf_line()? else {
                break;
            };
            let line = std::str::from_utf8(&line)
                .map_err(|_| Error::Handshake("non-ASCII auth line".into()))?
                .to_owned();
            if !line.is_ascii() {
                return Err(Error::Handshake("non-ASCII auth line".into()));
            }
            trace!("received auth line: {line}");
            self.handle_line(&line)?;
        }

        if self.authenticated {
            self.surrender_incoming();
        }

        Ok(())
    }

    /// Move everything left in the incoming buffer past the auth boundary.
    fn surrender_incoming(&mut self) {
        let rest = self.incoming.take();
        self.unused_bytes.extend_from_slice(&rest);
    }

    fn send(&mut self, command: Command) {
        trace!("sending auth line: {command:?}");
        self.outgoing.extend_from_slice(&Vec::<u8>::from(command));
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        let command = match Command::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                // Malformed arguments (bad hex/base64/guid). Tell the peer;
                // the server additionally treats it like a failed attempt.
                match &self.side {
                    Side::Server { .. } => {
                        self.send(Command::Error(format!("{e}")));
                    }
                    Side::Client { .. } => {
                        self.send(Command::Error("could not parse command".into()));
                    }
                }
                return Ok(());
            }
        };

        match &self.side {
            Side::Client { .. } => self.client_handle_command(command),
            Side::Server { .. } => self.server_handle_command(command),
        }
    }

    /*
     * Client side
     */

    fn client_state_mut(&mut self) -> &mut ClientState {
        match &mut self.side {
            Side::Client { state, .. } => state,
            Side::Server { .. } => unreachable!("client accessor on server side"),
        }
    }

    /// Send `AUTH` for the next untried mechanism. Returns false when none
    /// remain.
    fn client_try_next_mechanism(&mut self) -> Result<bool> {
        let Side::Client {
            state,
            mechs_to_try,
            current_mech,
            ..
        } = &mut self.side
        else {
            unreachable!("client accessor on server side")
        };

        let Some(mech) = mechs_to_try.pop_front() else {
            self.need_disconnect = true;
            return Ok(false);
        };
        *current_mech = Some(mech);
        *state = match mech {
            // The cookie server answers with a challenge first.
            AuthMechanism::Cookie => ClientState::WaitingForData,
            AuthMechanism::External => ClientState::WaitingForOk,
        };

        let initial_response = match mech {
            AuthMechanism::External => {
                // The stated identity: our effective uid in decimal. Sending
                // it with AUTH saves one round trip.
                let uid = unsafe { libc::geteuid() }.to_string();
                uid.into_bytes()
            }
            AuthMechanism::Cookie => userdb::current_username()?.into_bytes(),
        };

        self.send(Command::Auth(
            Some(mech.to_string()),
            Some(initial_response),
        ));

        Ok(true)
    }

    fn client_handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Rejected(server_mechs) => {
                let Side::Client {
                    mechs_to_try,
                    already_got_mechanisms,
                    ..
                } = &mut self.side
                else {
                    unreachable!()
                };
                if !*already_got_mechanisms {
                    *already_got_mechanisms = true;
                    // Keep our preference order, drop what the server will
                    // never accept.
                    mechs_to_try.retain(|m| server_mechs.iter().any(|s| s == &m.to_string()));
                }
                trace!("rejected; trying next auth mechanism");
                self.client_try_next_mechanism()?;
                Ok(())
            }
            Command::Ok(guid) => {
                let Side::Client {
                    state,
                    expected_guid,
                    server_guid,
                    ..
                } = &mut self.side
                else {
                    unreachable!()
                };
                match expected_guid {
                    Some(expected) if *expected != guid => {
                        self.need_disconnect = true;
                        return Err(Error::Handshake(format!(
                            "Server GUID mismatch: expected {expected}, got {guid}",
                        )));
                    }
                    _ => (),
                }
                *server_guid = Some(guid);
                *state = ClientState::Done;
                self.send(Command::Begin);
                self.authenticated_pending_output = true;
                Ok(())
            }
            Command::Data(data) => self.client_handle_data(data.unwrap_or_default()),
            Command::Error(_) => {
                // Server complained; abandon the current attempt. The
                // CANCEL provokes a REJECTED which moves us along.
                self.send(Command::Cancel);
                *self.client_state_mut() = ClientState::WaitingForReject;
                Ok(())
            }
            Command::Auth(..) | Command::Begin | Command::Cancel | Command::Unknown(_) => {
                self.send(Command::Error("Unknown command".into()));
                Ok(())
            }
        }
    }

    fn client_handle_data(&mut self, data: Vec<u8>) -> Result<()> {
        let Side::Client {
            state,
            current_mech,
            ..
        } = &self.side
        else {
            unreachable!()
        };

        if *state != ClientState::WaitingForData || *current_mech != Some(AuthMechanism::Cookie) {
            self.send(Command::Error("Unexpected DATA".into()));
            return Ok(());
        }

        // The payload is the cookie context name, the cookie ID, and the
        // server challenge, separated by spaces.
        let text = match std::str::from_utf8(&data) {
            Ok(text) => text,
            Err(_) => {
                self.send(Command::Error(
                    "Cookie challenge was not valid UTF-8".into(),
                ));
                return Ok(());
            }
        };
        let mut split = text.split_ascii_whitespace();
        let (context, id, server_challenge) = match (split.next(), split.next(), split.next()) {
            (Some(c), Some(i), Some(s)) => (c, i, s),
            _ => {
                self.send(Command::Error(
                    "Server did not send context/ID/challenge properly".into(),
                ));
                return Ok(());
            }
        };

        if !keyring::validate_context(context) {
            self.send(Command::Error("Server sent invalid cookie context".into()));
            return Ok(());
        }
        let id: u64 = match id.parse() {
            Ok(id) => id,
            Err(_) => {
                self.send(Command::Error(
                    "Could not parse cookie ID as an integer".into(),
                ));
                return Ok(());
            }
        };
        if server_challenge.is_empty() {
            self.send(Command::Error("Empty server challenge string".into()));
            return Ok(());
        }

        let keyring = match &self.keyring_directory {
            Some(dir) => Keyring::load_in_directory(dir.clone(), context),
            None => Keyring::load(None, context),
        };
        let secret = match keyring {
            Ok(keyring) => Secret::from(keyring.get_secret(id)),
            Err(e) => {
                warn!("could not load keyring: {e}");
                self.send(Command::Error("Could not load cookie file".into()));
                return Ok(());
            }
        };
        if secret.as_bytes().is_empty() {
            self.send(Command::Error("Don't have the requested cookie ID".into()));
            return Ok(());
        }

        let client_challenge = random_challenge_hex();
        let hash = cookie_hash(server_challenge, &client_challenge, &secret);
        let reply = format!("{client_challenge} {hash}");

        self.send(Command::Data(Some(reply.into_bytes())));
        *self.client_state_mut() = ClientState::WaitingForOk;
        Ok(())
    }

    /*
     * Server side
     */

    fn server_handle_command(&mut self, command: Command) -> Result<()> {
        let Side::Server { state, .. } = &self.side else {
            unreachable!()
        };
        let state = *state;

        // Between our OK and the client's BEGIN only BEGIN is legal.
        if state == ServerState::WaitingForBegin && !matches!(command, Command::Begin) {
            warn!("client sent {command:?} while BEGIN was expected");
            self.need_disconnect = true;
            return Ok(());
        }

        match command {
            Command::Auth(mech, initial_response) => {
                self.server_handle_auth(mech, initial_response)
            }
            Command::Data(data) => {
                let Side::Server { mech, .. } = &self.side else {
                    unreachable!()
                };
                let mech = *mech;
                match mech {
                    Some(mech) if state == ServerState::WaitingForData => {
                        self.server_feed_mechanism(mech, data.unwrap_or_default())
                    }
                    _ => {
                        self.send(Command::Error(
                            "Not currently in an auth conversation".into(),
                        ));
                        Ok(())
                    }
                }
            }
            Command::Begin => {
                if state == ServerState::WaitingForBegin {
                    self.authenticated = true;
                    self.surrender_incoming();
                } else {
                    // Client trying to send data before auth; kick it.
                    self.need_disconnect = true;
                    self.server_shutdown_mech();
                }
                Ok(())
            }
            Command::Cancel | Command::Error(_) => {
                self.server_shutdown_mech();
                self.server_send_rejected()
            }
            Command::Rejected(_) | Command::Ok(_) => {
                self.send(Command::Error("Unknown command".into()));
                Ok(())
            }
            Command::Unknown(_) => {
                self.send(Command::Error("Unknown command".into()));
                Ok(())
            }
        }
    }

    fn server_handle_auth(
        &mut self,
        mech_name: Option<String>,
        initial_response: Option<Vec<u8>>,
    ) -> Result<()> {
        let Side::Server { mech, .. } = &self.side else {
            unreachable!()
        };

        if mech.is_some() {
            self.send(Command::Error(
                "Sent AUTH while another AUTH in progress".into(),
            ));
            return Ok(());
        }

        let Some(mech_name) = mech_name else {
            // Bare AUTH asks for the mechanism list.
            return self.server_send_rejected();
        };

        let known = AuthMechanism::from_str(&mech_name)
            .ok()
            .filter(|m| self.mechanism_allowed(m));
        let Some(new_mech) = known else {
            trace!("client requested unsupported mechanism {mech_name}");
            return self.server_send_rejected();
        };

        let Side::Server { mech, state, .. } = &mut self.side else {
            unreachable!()
        };
        *mech = Some(new_mech);
        *state = ServerState::WaitingForData;

        match initial_response {
            Some(response) => self.server_feed_mechanism(new_mech, response),
            None => {
                // Ask for the initial response in a bare DATA round trip,
                // once per connection.
                let Side::Server {
                    already_asked_for_initial_response,
                    ..
                } = &mut self.side
                else {
                    unreachable!()
                };
                if *already_asked_for_initial_response {
                    self.send(Command::Error(
                        "Already asked for initial response".into(),
                    ));
                    return Ok(());
                }
                *already_asked_for_initial_response = true;
                self.send(Command::Data(None));
                Ok(())
            }
        }
    }

    fn mechanism_allowed(&self, mech: &AuthMechanism) -> bool {
        match &self.allowed_mechanisms {
            None => true,
            Some(allowed) => allowed.contains(mech),
        }
    }

    fn server_feed_mechanism(&mut self, mech: AuthMechanism, data: Vec<u8>) -> Result<()> {
        match mech {
            AuthMechanism::External => self.server_external_data(data),
            AuthMechanism::Cookie => self.server_cookie_data(data),
        }
    }

    /// EXTERNAL: the transport already proved who the peer is; check the
    /// stated identity against it.
    fn server_external_data(&mut self, data: Vec<u8>) -> Result<()> {
        let Side::Server {
            client_credentials, ..
        } = &self.side
        else {
            unreachable!()
        };
        let client_credentials = *client_credentials;

        let Some(socket_uid) = client_credentials.unix_user_id() else {
            trace!("no credentials from transport; rejecting EXTERNAL");
            return self.server_send_rejected();
        };

        if !data.is_empty() {
            // A stated identity must be our peer's decimal uid.
            let stated = std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.parse::<u32>().ok());
            match stated {
                Some(uid) if uid == socket_uid => (),
                _ => {
                    trace!("stated identity does not match socket credentials");
                    return self.server_send_rejected();
                }
            }
        }

        self.server_complete(client_credentials);
        Ok(())
    }

    fn server_cookie_data(&mut self, data: Vec<u8>) -> Result<()> {
        let Side::Server { cookie, .. } = &self.side else {
            unreachable!()
        };

        if cookie.cookie_id.is_none() {
            self.server_cookie_first_response(data)
        } else {
            self.server_cookie_second_response(data)
        }
    }

    /// First client response: the desired username. Answer with
    /// `<context> <cookie-id> <challenge-hex>`.
    fn server_cookie_first_response(&mut self, data: Vec<u8>) -> Result<()> {
        let Ok(username) = String::from_utf8(data) else {
            trace!("cookie username was not valid UTF-8");
            return self.server_send_rejected();
        };
        if username.is_empty() {
            return self.server_send_rejected();
        }

        let keyring = match &self.keyring_directory {
            Some(dir) => {
                Keyring::open_in_directory(dir.clone(), None, DEFAULT_COOKIE_CONTEXT)
            }
            None => Keyring::open(Some(&username), DEFAULT_COOKIE_CONTEXT),
        };
        let keyring = match keyring {
            Ok(keyring) => keyring,
            Err(e) => {
                warn!("could not open keyring for {username}: {e}");
                return self.server_send_rejected();
            }
        };
        let cookie_id = match keyring.get_best_key() {
            Ok(id) => id,
            Err(e) => {
                warn!("no cookie to offer: {e}");
                return self.server_send_rejected();
            }
        };

        let desired_identity = {
            let mut db = userdb::user_database().lock()?;
            match db.user_by_name(&username) {
                Ok(entry) => Credentials::empty().set_unix_user_id(entry.uid),
                Err(_) => {
                    trace!("did not get a valid username from client");
                    return self.server_send_rejected();
                }
            }
        };

        let challenge = random_challenge_hex();
        let payload = format!("{} {cookie_id} {challenge}", keyring.context());

        let Side::Server { cookie, authorized_identity, .. } = &mut self.side else {
            unreachable!()
        };
        cookie.cookie_id = Some(cookie_id);
        cookie.challenge_hex = challenge;
        cookie.keyring = Some(keyring);
        // Remembered now, granted only after the hash verifies.
        *authorized_identity = desired_identity;

        self.send(Command::Data(Some(payload.into_bytes())));
        Ok(())
    }

    /// Second client response: `<client-challenge-hex> <hash-hex>`.
    fn server_cookie_second_response(&mut self, data: Vec<u8>) -> Result<()> {
        let Side::Server { cookie, .. } = &self.side else {
            unreachable!()
        };

        let text = match std::str::from_utf8(&data) {
            Ok(text) => text,
            Err(_) => {
                trace!("cookie response was not valid UTF-8");
                return self.server_send_rejected();
            }
        };
        let mut split = text.split_ascii_whitespace();
        let (client_challenge, client_hash) = match (split.next(), split.next()) {
            (Some(c), Some(h)) if !c.is_empty() && !h.is_empty() => (c, h),
            _ => {
                trace!("zero-length client challenge or hash");
                return self.server_send_rejected();
            }
        };

        // An unknown cookie id hashed over the empty secret: rejection stays
        // indistinguishable from a wrong hash.
        let (id, server_challenge) = (
            cookie.cookie_id.unwrap_or_default(),
            cookie.challenge_hex.clone(),
        );
        let secret = Secret::from(
            cookie
                .keyring
                .as_ref()
                .map(|k| k.get_secret(id))
                .unwrap_or_default(),
        );
        let correct_hash = cookie_hash(&server_challenge, client_challenge, &secret);

        if !constant_time_eq(client_hash.as_bytes(), correct_hash.as_bytes()) {
            trace!("cookie hash mismatch");
            return self.server_send_rejected();
        }

        let Side::Server { authorized_identity, .. } = &self.side else {
            unreachable!()
        };
        let identity = *authorized_identity;
        self.server_complete(identity);
        Ok(())
    }

    /// Mechanism succeeded: send `OK <guid>` and wait for `BEGIN`.
    fn server_complete(&mut self, identity: Credentials) {
        let Side::Server {
            state,
            guid,
            authorized_identity,
            ..
        } = &mut self.side
        else {
            unreachable!()
        };
        *authorized_identity = identity;
        *state = ServerState::WaitingForBegin;
        let guid = guid.clone();
        trace!("authenticated peer {identity:?}; waiting for BEGIN");
        self.send(Command::Ok(guid));
    }

    fn server_shutdown_mech(&mut self) {
        let Side::Server { mech, state, cookie, .. } = &mut self.side else {
            unreachable!()
        };
        *mech = None;
        cookie.reset();
        if *state != ServerState::WaitingForBegin {
            *state = ServerState::WaitingForAuth;
        }
    }

    /// Reject the current attempt, offering the mechanism list. Too many of
    /// these and the connection is dropped.
    fn server_send_rejected(&mut self) -> Result<()> {
        self.server_shutdown_mech();

        let mechs: Vec<String> = AuthMechanism::all()
            .iter()
            .copied()
            .filter(|m| self.mechanism_allowed(m))
            .map(|m| m.to_string())
            .collect();
        self.send(Command::Rejected(mechs));

        let Side::Server {
            failures,
            max_failures,
            ..
        } = &mut self.side
        else {
            unreachable!()
        };
        *failures += 1;
        if *failures >= *max_failures {
            warn!("too many failed auth attempts; disconnecting");
            self.need_disconnect = true;
        }

        Ok(())
    }
}

/// `SHA1("<server-challenge>:<client-challenge>:<secret>")`, hex-encoded.
fn cookie_hash(server_challenge: &str, client_challenge: &str, secret: &Secret) -> String {
    let mut to_hash =
        Vec::with_capacity(server_challenge.len() + client_challenge.len() + secret.as_bytes().len() + 2);
    to_hash.extend_from_slice(server_challenge.as_bytes());
    to_hash.push(b':');
    to_hash.extend_from_slice(client_challenge.as_bytes());
    to_hash.push(b':');
    to_hash.extend_from_slice(secret.as_bytes());
    let hash = sha1_hex(&to_hash);
    // The pre-image embeds the cookie secret.
    drop(Secret::new(to_hash));
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(uid: u32) -> Credentials {
        Credentials::empty().set_unix_user_id(uid).set_process_id(1)
    }

    fn my_uid() -> u32 {
        (unsafe { libc::geteuid() }) as u32
    }

    fn server() -> Auth {
        Auth::server(OwnedGuid::generate(), creds(my_uid()), None)
    }

    fn drain(auth: &mut Auth) -> String {
        let out = String::from_utf8(auth.outgoing().to_vec()).unwrap();
        let n = auth.outgoing().len();
        auth.consume_outgoing(n);
        out
    }

    #[test]
    fn command_round_trips() {
        let line = Command::Auth(Some("EXTERNAL".into()), Some(b"1000".to_vec())).to_string();
        assert_eq!(line, "AUTH EXTERNAL 31303030\r\n");
        assert_eq!(
            Command::from_str(line.trim_end()).unwrap(),
            Command::Auth(Some("EXTERNAL".into()), Some(b"1000".to_vec()))
        );

        let data = Command::Data(Some(b"ctx 42 abcd".to_vec())).to_string();
        assert_eq!(data, format!("DATA {}\r\n", base64_encode(b"ctx 42 abcd")));
        assert_eq!(
            Command::from_str(data.trim_end()).unwrap(),
            Command::Data(Some(b"ctx 42 abcd".to_vec()))
        );

        assert!(matches!(
            Command::from_str("FROB x").unwrap(),
            Command::Unknown(_)
        ));
    }

    #[test]
    fn external_happy_path() {
        let mut server = server();

        let auth = format!("AUTH EXTERNAL {}\r\n", hex_encode(my_uid().to_string().as_bytes()));
        server.handle_input(auth.as_bytes()).unwrap();
        let reply = drain(&mut server);
        assert!(reply.starts_with("OK "), "got {reply}");
        assert!(!server.authenticated());

        server.handle_input(b"BEGIN\r\n").unwrap();
        assert!(server.authenticated());
        assert_eq!(
            server.authorized_identity().unix_user_id(),
            Some(my_uid())
        );
    }

    #[test]
    fn external_empty_identity_means_socket_uid() {
        let mut server = server();
        server.handle_input(b"AUTH EXTERNAL\r\n").unwrap();
        // Bare AUTH EXTERNAL asks us to prompt for the response.
        assert_eq!(drain(&mut server), "DATA\r\n");

        server.handle_input(b"DATA\r\n").unwrap();
        assert!(drain(&mut server).starts_with("OK "));
    }

    #[test]
    fn external_wrong_identity_rejected() {
        let mut server = server();
        let other_uid = my_uid() + 1;
        let auth = format!(
            "AUTH EXTERNAL {}\r\n",
            hex_encode(other_uid.to_string().as_bytes())
        );
        server.handle_input(auth.as_bytes()).unwrap();
        let reply = drain(&mut server);
        assert_eq!(reply, "REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n");
    }

    #[test]
    fn external_without_transport_credentials_rejected() {
        let mut server = Auth::server(OwnedGuid::generate(), Credentials::empty(), None);
        let auth = format!("AUTH EXTERNAL {}\r\n", hex_encode(b"1000"));
        server.handle_input(auth.as_bytes()).unwrap();
        assert!(drain(&mut server).starts_with("REJECTED"));
    }

    #[test]
    fn bare_auth_lists_mechanisms() {
        let mut server = server();
        server.handle_input(b"AUTH\r\n").unwrap();
        assert_eq!(drain(&mut server), "REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n");
    }

    #[test]
    fn unknown_command_answered_not_fatal() {
        let mut server = server();
        server.handle_input(b"FROBNICATE\r\n").unwrap();
        assert_eq!(drain(&mut server), "ERROR \"Unknown command\"\r\n");
        assert!(!server.needs_disconnect());
    }

    #[test]
    fn unknown_mechanism_rejected() {
        let mut server = server();
        server.handle_input(b"AUTH KERBEROS_V4\r\n").unwrap();
        assert!(drain(&mut server).starts_with("REJECTED"));
    }

    #[test]
    fn data_without_conversation_is_an_error() {
        let mut server = server();
        server.handle_input(b"DATA deadbeef\r\n").unwrap();
        assert_eq!(
            drain(&mut server),
            "ERROR \"Not currently in an auth conversation\"\r\n"
        );
    }

    #[test]
    fn too_many_failures_disconnect() {
        let mut server = server();
        for _ in 0..6 {
            server.handle_input(b"AUTH NOSUCH\r\n").unwrap();
            drain(&mut server);
        }
        assert!(server.needs_disconnect());
    }

    #[test]
    fn begin_before_ok_disconnects() {
        let mut server = server();
        server.handle_input(b"BEGIN\r\n").unwrap();
        assert!(server.needs_disconnect());
    }

    #[test]
    fn data_between_ok_and_begin_disconnects() {
        let mut server = server();
        let auth = format!("AUTH EXTERNAL {}\r\n", hex_encode(my_uid().to_string().as_bytes()));
        server.handle_input(auth.as_bytes()).unwrap();
        drain(&mut server);

        server.handle_input(b"DATA\r\n").unwrap();
        assert!(server.needs_disconnect());
    }

    #[test]
    fn pipelined_bytes_after_begin_are_surrendered() {
        let mut server = server();
        let auth = format!("AUTH EXTERNAL {}\r\n", hex_encode(my_uid().to_string().as_bytes()));
        server.handle_input(auth.as_bytes()).unwrap();
        drain(&mut server);

        server.handle_input(b"BEGIN\r\nl\x01\x02\x03").unwrap();
        assert!(server.authenticated());
        assert_eq!(server.take_unused_bytes(), b"l\x01\x02\x03");
    }

    #[test]
    fn client_sends_initial_auth_and_begins_on_ok() {
        let mut client = Auth::client(None, None).unwrap();
        let opening = drain(&mut client);
        let expected = format!(
            "AUTH EXTERNAL {}\r\n",
            hex_encode(my_uid().to_string().as_bytes())
        );
        assert_eq!(opening, expected);

        let guid = OwnedGuid::generate();
        client
            .handle_input(format!("OK {guid}\r\n").as_bytes())
            .unwrap();
        assert_eq!(drain(&mut client), "BEGIN\r\n");
        // Draining the output is what completes the client side.
        assert!(client.authenticated());
        assert_eq!(client.server_guid(), Some(&guid));
    }

    #[test]
    fn client_guid_mismatch_fails() {
        let expected = OwnedGuid::generate();
        let mut client = Auth::client(None, Some(expected)).unwrap();
        drain(&mut client);

        let other = OwnedGuid::generate();
        let res = client.handle_input(format!("OK {other}\r\n").as_bytes());
        assert!(res.is_err());
        assert!(client.needs_disconnect());
    }

    #[test]
    fn client_falls_back_to_next_mechanism_on_reject() {
        let mut client = Auth::client(None, None).unwrap();
        drain(&mut client);

        client
            .handle_input(b"REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n")
            .unwrap();
        let next = drain(&mut client);
        assert!(next.starts_with("AUTH DBUS_COOKIE_SHA1 "), "got {next}");

        // Nothing left to try after a second rejection.
        client
            .handle_input(b"REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n")
            .unwrap();
        assert!(client.needs_disconnect());
    }

    #[test]
    fn client_cancels_on_server_error() {
        let mut client = Auth::client(None, None).unwrap();
        drain(&mut client);

        client.handle_input(b"ERROR \"nope\"\r\n").unwrap();
        assert_eq!(drain(&mut client), "CANCEL\r\n");
    }

    #[test]
    fn cookie_full_exchange_against_real_keyring() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("keyrings");
        std::fs::DirBuilder::new()
            .mode_private()
            .create(&dir)
            .unwrap();

        let mut server = server();
        server.set_keyring_directory(dir.clone());
        let mut client = Auth::client(Some(vec![AuthMechanism::Cookie]), None).unwrap();
        client.set_keyring_directory(dir);

        // Pump lines between the two engines until both settle.
        for _ in 0..8 {
            let c2s = {
                let n = client.outgoing().len();
                let bytes = client.outgoing().to_vec();
                client.consume_outgoing(n);
                bytes
            };
            if !c2s.is_empty() {
                server.handle_input(&c2s).unwrap();
            }
            let s2c = {
                let n = server.outgoing().len();
                let bytes = server.outgoing().to_vec();
                server.consume_outgoing(n);
                bytes
            };
            if !s2c.is_empty() {
                client.handle_input(&s2c).unwrap();
            }
            if server.authenticated() && client.authenticated() {
                break;
            }
        }

        assert!(client.authenticated(), "client did not authenticate");
        assert!(server.authenticated(), "server did not authenticate");
        assert_eq!(
            server.authorized_identity().unix_user_id(),
            Some(my_uid())
        );
    }

    #[test]
    fn cookie_wrong_hash_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("keyrings");
        std::fs::DirBuilder::new()
            .mode_private()
            .create(&dir)
            .unwrap();

        let mut server = server();
        server.set_keyring_directory(dir);

        let auth = format!(
            "AUTH DBUS_COOKIE_SHA1 {}\r\n",
            hex_encode(userdb::current_username().unwrap().as_bytes())
        );
        server.handle_input(auth.as_bytes()).unwrap();
        let challenge_line = drain(&mut server);
        assert!(challenge_line.starts_with("DATA "), "got {challenge_line}");

        // Answer with a well-formed but wrong hash.
        let bogus = format!(
            "DATA {}\r\n",
            base64_encode(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 0000000000000000000000000000000000000000")
        );
        server.handle_input(bogus.as_bytes()).unwrap();
        assert_eq!(drain(&mut server), "REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n");
        assert!(!server.authenticated());
    }

    #[test]
    fn auth_buffer_overflow_disconnects() {
        let mut server = server();
        let junk = vec![b'A'; MAX_AUTH_BUFFER + 1];
        assert!(server.handle_input(&junk).is_err());
        assert!(server.needs_disconnect());
    }

    /// `DirBuilder::mode` helper so the tests read naturally.
    trait ModePrivate {
        fn mode_private(&mut self) -> &mut Self;
    }

    impl ModePrivate for std::fs::DirBuilder {
        fn mode_private(&mut self) -> &mut Self {
            use std::os::unix::fs::DirBuilderExt;
            self.mode(0o700)
        }
    }
}
