//! Peer credentials carried by local socket transports.

use std::io;
use std::os::fd::BorrowedFd;

/// Credentials of the process on the other end of a connection.
///
/// Each field carries an explicit "unset" state: a transport that cannot
/// determine a particular credential (TCP, or a platform without the
/// corresponding socket option) simply leaves it out. Once recorded by the
/// transport at connection start the value never changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pid: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl Credentials {
    /// Credentials with every field unset.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The credentials of the calling process.
    pub fn from_current_process() -> Self {
        let pid = std::process::id();
        let uid = unsafe { libc::geteuid() } as u32;
        let gid = unsafe { libc::getegid() } as u32;

        Self::default()
            .set_process_id(pid)
            .set_unix_user_id(uid)
            .set_unix_group_id(gid)
    }

    /// Read the peer credentials of a connected local socket.
    pub fn from_socket(fd: BorrowedFd<'_>) -> io::Result<Self> {
        #[cfg(any(target_os = "android", target_os = "linux"))]
        {
            let creds = rustix::net::sockopt::socket_peercred(fd)?;
            Ok(Self::default()
                .set_process_id(creds.pid.as_raw_nonzero().get() as u32)
                .set_unix_user_id(creds.uid.as_raw() as u32)
                .set_unix_group_id(creds.gid.as_raw() as u32))
        }

        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ))]
        {
            use std::os::fd::AsRawFd;

            let (uid, gid) = nix::unistd::getpeereid(fd.as_raw_fd())
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(Self::default()
                .set_unix_user_id(uid.as_raw())
                .set_unix_group_id(gid.as_raw()))
        }
    }

    /// The numeric Unix user ID, if known.
    pub fn unix_user_id(&self) -> Option<u32> {
        self.uid
    }

    /// The numeric Unix group ID, if known.
    pub fn unix_group_id(&self) -> Option<u32> {
        self.gid
    }

    /// The numeric process ID, if known.
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Set the numeric Unix user ID.
    pub fn set_unix_user_id(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Set the numeric Unix group ID.
    pub fn set_unix_group_id(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Set the numeric process ID.
    pub fn set_process_id(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Whether both sides carry the same, known user ID.
    ///
    /// Unset user IDs never match anything, including another unset one.
    pub fn same_user_as(&self, other: &Self) -> bool {
        match (self.uid, other.uid) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Whether every credential set in `other` is present and equal in `self`.
    pub fn is_superset_of(&self, other: &Self) -> bool {
        fn covers(mine: Option<u32>, theirs: Option<u32>) -> bool {
            match theirs {
                None => true,
                Some(t) => mine == Some(t),
            }
        }

        covers(self.pid, other.pid) && covers(self.uid, other.uid) && covers(self.gid, other.gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_never_match() {
        let empty = Credentials::empty();
        assert!(!empty.same_user_as(&empty));
        assert!(!empty.same_user_as(&Credentials::empty().set_unix_user_id(0)));
    }

    #[test]
    fn superset_checks() {
        let full = Credentials::empty()
            .set_process_id(42)
            .set_unix_user_id(1000)
            .set_unix_group_id(1000);
        let uid_only = Credentials::empty().set_unix_user_id(1000);

        assert!(full.is_superset_of(&uid_only));
        assert!(full.is_superset_of(&Credentials::empty()));
        assert!(!uid_only.is_superset_of(&full));
        assert!(!full.is_superset_of(&Credentials::empty().set_unix_user_id(0)));
    }

    #[test]
    fn current_process_has_all_fields() {
        let creds = Credentials::from_current_process();
        assert!(creds.process_id().is_some());
        assert!(creds.unix_user_id().is_some());
        assert!(creds.unix_group_id().is_some());
        assert!(creds.same_user_as(&creds));
    }
}
