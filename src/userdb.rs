//! Cached access to the system user database.
//!
//! Cookie authentication needs to map the client's stated username onto a
//! uid and home directory, and the EXTERNAL mechanism needs the reverse
//! mapping. Lookups go through a process-wide cache guarded by one mutex;
//! the mutex also serializes the underlying non-reentrant `getpw*` calls.

use std::{
    collections::HashMap,
    ffi::{CStr, CString, OsStr},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    sync::{Mutex, OnceLock},
};

use crate::{Error, Result};

/// One user database entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserEntry {
    pub username: String,
    pub uid: u32,
    pub primary_gid: u32,
    pub homedir: PathBuf,
}

/// A cache over the passwd database.
///
/// The process-wide instance is reached through [`user_database`]; tests that
/// need a fresh world construct their own with [`UserDatabase::new`].
#[derive(Debug, Default)]
pub struct UserDatabase {
    by_name: HashMap<String, Option<UserEntry>>,
    by_uid: HashMap<u32, Option<UserEntry>>,
}

impl UserDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a user up by name, consulting the cache first.
    ///
    /// Negative results are cached too, so a peer repeatedly claiming a
    /// nonexistent identity does not hammer NSS.
    pub fn user_by_name(&mut self, name: &str) -> Result<UserEntry> {
        if !self.by_name.contains_key(name) {
            let entry = lookup_by_name(name)?;
            if let Some(entry) = &entry {
                self.by_uid.insert(entry.uid, Some(entry.clone()));
            }
            self.by_name.insert(name.to_owned(), entry);
        }

        self.by_name
            .get(name)
            .and_then(|e| e.clone())
            .ok_or_else(|| Error::Handshake(format!("unknown user `{name}`")))
    }

    /// Look a user up by uid, consulting the cache first.
    pub fn user_by_uid(&mut self, uid: u32) -> Result<UserEntry> {
        if !self.by_uid.contains_key(&uid) {
            let entry = lookup_by_uid(uid);
            if let Some(entry) = &entry {
                self.by_name.insert(entry.username.clone(), Some(entry.clone()));
            }
            self.by_uid.insert(uid, entry);
        }

        self.by_uid
            .get(&uid)
            .and_then(|e| e.clone())
            .ok_or_else(|| Error::Handshake(format!("unknown uid {uid}")))
    }

    /// Home directory of the given uid.
    pub fn homedir_of_uid(&mut self, uid: u32) -> Result<PathBuf> {
        self.user_by_uid(uid).map(|e| e.homedir)
    }
}

/// The process-wide user database.
pub fn user_database() -> &'static Mutex<UserDatabase> {
    static DB: OnceLock<Mutex<UserDatabase>> = OnceLock::new();
    DB.get_or_init(|| Mutex::new(UserDatabase::new()))
}

/// Username of the effective uid of this process.
pub fn current_username() -> Result<String> {
    let uid = unsafe { libc::geteuid() } as u32;
    let mut db = user_database().lock()?;
    db.user_by_uid(uid).map(|e| e.username)
}

/// Home directory of the current process's user.
///
/// `$HOME` wins over the passwd entry so tests and sandboxed environments can
/// redirect keyring storage.
pub fn home_dir() -> Option<PathBuf> {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => Some(home.into()),
        _ => {
            let uid = unsafe { libc::geteuid() } as u32;
            let mut db = user_database().lock().ok()?;
            db.homedir_of_uid(uid).ok()
        }
    }
}

fn lookup_by_name(name: &str) -> Result<Option<UserEntry>> {
    let c_name = CString::new(name)
        .map_err(|_| Error::Handshake(format!("username `{name}` contains a nul byte")))?;
    let passwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    Ok(entry_from_passwd(passwd))
}

fn lookup_by_uid(uid: u32) -> Option<UserEntry> {
    let passwd = unsafe { libc::getpwuid(uid as libc::uid_t) };
    entry_from_passwd(passwd)
}

fn entry_from_passwd(passwd: *mut libc::passwd) -> Option<UserEntry> {
    // getpwnam(3): the result may be NULL (no such user, or an error) and
    // points to static storage otherwise. Callers hold the database mutex, so
    // the static buffer cannot be overwritten while we copy out of it.
    if passwd.is_null() {
        return None;
    }

    // SAFETY: non-NULL return from getpw* is a valid passwd struct.
    let passwd = unsafe { &*passwd };
    if passwd.pw_name.is_null() || passwd.pw_dir.is_null() {
        return None;
    }

    // SAFETY: both pointers are valid nul-terminated strings per getpw*.
    let name = unsafe { CStr::from_ptr(passwd.pw_name) };
    let dir = unsafe { CStr::from_ptr(passwd.pw_dir) };

    Some(UserEntry {
        username: String::from_utf8_lossy(name.to_bytes()).into_owned(),
        uid: passwd.pw_uid as u32,
        primary_gid: passwd.pw_gid as u32,
        homedir: PathBuf::from(OsStr::from_bytes(dir.to_bytes())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_user_resolves_both_ways() {
        let uid = unsafe { libc::geteuid() } as u32;
        let mut db = UserDatabase::new();

        let by_uid = db.user_by_uid(uid).unwrap();
        let by_name = db.user_by_name(&by_uid.username).unwrap();
        assert_eq!(by_uid, by_name);
        assert_eq!(by_uid.uid, uid);
    }

    #[test]
    fn unknown_user_is_an_error_and_cached() {
        let mut db = UserDatabase::new();
        assert!(db.user_by_name("no-such-user-corebus").is_err());
        // Second lookup hits the negative cache.
        assert!(db.user_by_name("no-such-user-corebus").is_err());
    }
}
