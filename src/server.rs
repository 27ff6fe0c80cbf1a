//! Listening for incoming connections.
//!
//! A [`Server`] binds one or more listenable addresses, authenticates each
//! accepted socket with the server role, and hands the resulting
//! [`Connection`] to the registered callback, which decides whether to keep
//! it.

use std::{
    net::TcpListener,
    os::fd::{AsRawFd, RawFd},
    os::unix::net::UnixListener,
    path::PathBuf,
    time::Duration,
};

use log::{trace, warn};

use crate::{
    address::{
        escape_value,
        transport::{Transport, UnixSocket},
        Address,
    },
    connection::{handshake::ServerHandshake, socket::BoxedSplit, AuthMechanism, Connection},
    guid::OwnedGuid,
    sha1::random_hex,
    watch::{Watch, WatchFlags},
    Error, Result,
};

/// How long an accepted socket gets to finish the credential exchange and
/// the auth conversation before it is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type NewConnectionFn = dyn FnMut(Connection) + Send;

enum Listener {
    Unix {
        listener: UnixListener,
        /// Socket file to unlink when the server goes away.
        cleanup: Option<PathBuf>,
        address: String,
    },
    Tcp {
        listener: TcpListener,
        address: String,
    },
}

impl Listener {
    fn address(&self) -> &str {
        match self {
            Listener::Unix { address, .. } => address,
            Listener::Tcp { address, .. } => address,
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
            Listener::Tcp { listener, .. } => listener.as_raw_fd(),
        }
    }
}

/// A multi-address listening endpoint with a stable GUID.
pub struct Server {
    listeners: Vec<Listener>,
    guid: OwnedGuid,
    new_connection: Option<Box<NewConnectionFn>>,
    mechanisms: Option<Vec<AuthMechanism>>,
    keyring_directory: Option<PathBuf>,
}

impl Server {
    /// Bind every entry of a `;`-separated listenable address list.
    pub fn listen(addresses: &str) -> Result<Server> {
        let list = Address::parse_list(addresses)?;
        let guid = OwnedGuid::generate();
        let mut listeners = Vec::with_capacity(list.len());

        for address in list {
            listeners.push(bind_one(address)?);
        }

        Ok(Server {
            listeners,
            guid,
            new_connection: None,
            mechanisms: None,
            keyring_directory: None,
        })
    }

    /// The GUID included in every `OK` this server sends.
    pub fn guid(&self) -> &OwnedGuid {
        &self.guid
    }

    /// The bound addresses (kernel-assigned ports and generated socket
    /// names resolved), each carrying `guid=`, `;`-joined.
    pub fn address(&self) -> String {
        let guid = &self.guid;
        self.listeners
            .iter()
            .map(|l| format!("{},guid={guid}", l.address()))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Restrict the offered auth mechanisms.
    pub fn set_auth_mechanisms(&mut self, mechanisms: Vec<AuthMechanism>) {
        self.mechanisms = Some(mechanisms);
    }

    /// Redirect cookie keyring storage, for tests and sandboxes.
    pub fn set_keyring_directory(&mut self, directory: PathBuf) {
        self.keyring_directory = Some(directory);
    }

    /// Install the callback receiving each authenticated connection.
    ///
    /// Dropping the passed `Connection` refuses it.
    pub fn set_new_connection_callback(&mut self, callback: impl FnMut(Connection) + Send + 'static) {
        self.new_connection = Some(Box::new(callback));
    }

    /// Watches describing the listening sockets, for host-loop integration:
    /// poll them and call [`Server::accept_one`] on readiness.
    pub fn listen_watches(&self) -> Vec<Watch> {
        self.listeners
            .iter()
            .map(|l| Watch::new(l.as_raw_fd(), WatchFlags::Readable.into(), true))
            .collect()
    }

    /// Accept and authenticate one connection, blocking up to the handshake
    /// timeout, then invoke the callback. `listener_index` picks which bound
    /// address to accept on.
    pub fn accept_one(&mut self, listener_index: usize) -> Result<()> {
        let listener = self
            .listeners
            .get(listener_index)
            .ok_or_else(|| Error::Address("no such listener".into()))?;

        let split: BoxedSplit = match listener {
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept()?;
                stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                stream.into()
            }
            Listener::Tcp { listener, .. } => {
                let (stream, _addr) = listener.accept()?;
                stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                stream.set_nodelay(true)?;
                stream.into()
            }
        };

        trace!("accepted connection; starting server handshake");
        let mut handshake = ServerHandshake::new(split, self.guid.clone(), self.mechanisms.clone());
        if let Some(dir) = &self.keyring_directory {
            handshake.set_keyring_directory(dir.clone());
        }

        let conn = match handshake.perform().and_then(Connection::new_authenticated) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("dropping connection that failed to authenticate: {e}");
                return Err(e);
            }
        };

        match &mut self.new_connection {
            Some(callback) => callback(conn),
            None => {
                trace!("no new-connection callback registered; dropping connection");
            }
        }

        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for listener in &self.listeners {
            if let Listener::Unix {
                cleanup: Some(path),
                ..
            } = listener
            {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

fn bind_one(address: Address) -> Result<Listener> {
    match address.transport().clone() {
        Transport::Unix(unix) => {
            let (listener, cleanup, address) = match unix.take_path() {
                UnixSocket::File(path) => {
                    let listener = UnixListener::bind(&path)?;
                    let addr = format!("unix:path={}", escape_value(&path.to_string_lossy()));
                    (listener, Some(path), addr)
                }
                #[cfg(target_os = "linux")]
                UnixSocket::Abstract(name) => {
                    use std::os::linux::net::SocketAddrExt;
                    use std::os::unix::net::SocketAddr;

                    let addr = SocketAddr::from_abstract_name(name.as_encoded_bytes())?;
                    let listener = UnixListener::bind_addr(&addr)?;
                    let addr = format!(
                        "unix:abstract={}",
                        escape_value(&name.to_string_lossy())
                    );
                    (listener, None, addr)
                }
                UnixSocket::Dir(dir) | UnixSocket::TmpDir(dir) => {
                    // The server invents a socket name under the directory.
                    let path = dir.join(format!("dbus-{}", random_hex(8)));
                    let listener = UnixListener::bind(&path)?;
                    let addr = format!("unix:path={}", escape_value(&path.to_string_lossy()));
                    (listener, Some(path), addr)
                }
            };

            Ok(Listener::Unix {
                listener,
                cleanup,
                address,
            })
        }
        Transport::Tcp(tcp) => {
            let listener = TcpListener::bind((tcp.host(), tcp.port()))?;
            // Report the kernel-assigned port when 0 was requested.
            let port = listener.local_addr().map(|a| a.port()).unwrap_or(tcp.port());
            let address = format!("tcp:host={},port={port}", escape_value(tcp.host()));

            Ok(Listener::Tcp { listener, address })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn listens_on_a_directory_address() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = format!("unix:dir={}", tmp.path().display());

        let server = Server::listen(&addr).unwrap();
        let reported = server.address();
        assert!(reported.starts_with("unix:path="), "got {reported}");
        assert!(reported.contains("dbus-"));
        assert!(reported.contains(&format!("guid={}", server.guid())));
    }

    #[test]
    fn tcp_listen_reports_assigned_port() {
        let server = Server::listen("tcp:host=127.0.0.1,port=0").unwrap();
        let reported = server.address();
        assert!(reported.starts_with("tcp:host=127.0.0.1,port="));
        assert!(!reported.contains("port=0,"), "got {reported}");
    }

    #[test]
    fn accepts_and_authenticates_a_client() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = format!("unix:dir={}", tmp.path().display());

        let mut server = Server::listen(&addr).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let (sender, receiver) = std::sync::mpsc::channel();
        server.set_new_connection_callback(move |conn| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = sender.send(conn);
        });

        let address = server.address();
        let client = std::thread::spawn(move || Connection::open(&address));

        server.accept_one(0).unwrap();
        let client = client.join().unwrap().unwrap();

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        let server_conn = receiver.recv().unwrap();
        assert_eq!(
            server_conn.peer_credentials().unwrap().unix_user_id(),
            Some(unsafe { libc::geteuid() } as u32)
        );
        // The client verified the guid= in the server's address during auth.
        assert_eq!(client.server_guid().unwrap(), *server.guid());
    }

    #[test]
    fn socket_file_is_removed_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let addr = format!("unix:dir={}", tmp.path().display());

        let path = {
            let server = Server::listen(&addr).unwrap();
            let reported = server.address();
            let path = reported
                .strip_prefix("unix:path=")
                .unwrap()
                .split(',')
                .next()
                .unwrap()
                .to_owned();
            assert!(std::fs::metadata(&path).is_ok());
            path
        };

        assert!(std::fs::metadata(&path).is_err());
    }
}
