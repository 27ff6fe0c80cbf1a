//! Cookie keyring for `DBUS_COOKIE_SHA1` authentication.
//!
//! Cookies live in `$HOME/.dbus-keyrings/<context>`, one per line as
//! `<id> <creation-time> <secret-hex>`. The directory must be private to the
//! user; modifications happen under an exclusive dot-lock and replace the
//! file atomically.

use std::{
    fs,
    io::Write,
    os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{trace, warn};

use crate::{sha1::random_hex, userdb, Error, Result};

/// Directory under the user's home holding one keyring file per context.
const KEYRING_DIR: &str = ".dbus-keyrings";

/// Cookies older than this are purged when the keyring is opened.
const MAX_COOKIE_AGE: Duration = Duration::from_secs(300);

/// A fresh cookie is minted when no cookie younger than this exists.
const NEW_KEY_INTERVAL: Duration = Duration::from_secs(300);

/// Tolerance for cookies stamped in the future (clock skew between
/// processes sharing a home directory).
const MAX_TIME_TRAVEL: Duration = Duration::from_secs(300);

/// Upper bound on cookies retained per context.
const MAX_COOKIES: usize = 7;

/// Cookie secret size in hex digits (24 random bytes).
const SECRET_HEX_LEN: usize = 48;

/// How long to contend for the lock file before stealing it.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// One shared secret in a keyring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub id: u64,
    pub creation_time: u64,
    pub secret: String,
}

/// The cookies of one `(user, context)` pair.
#[derive(Debug)]
pub struct Keyring {
    directory: PathBuf,
    context: String,
    cookies: Vec<Cookie>,
}

/// Whether `context` is safe to use as a filename fragment.
///
/// Callers must validate any context received from the peer before opening a
/// keyring with it.
pub fn validate_context(context: &str) -> bool {
    !context.is_empty()
        && context
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Keyring {
    /// Open (and refresh) the keyring for `username` in `context`.
    ///
    /// Takes the lock, creates the keyring directory if needed, drops expired
    /// cookies, mints a new cookie if none is recent enough, rewrites the
    /// file atomically and releases the lock. `None` means the current user.
    pub fn open(username: Option<&str>, context: &str) -> Result<Keyring> {
        let (directory, owner_uid) = keyring_directory(username)?;
        Self::open_in_directory(directory, Some(owner_uid), context)
    }

    /// Like [`Keyring::open`] but rooted at an explicit directory, bypassing
    /// the home-directory resolution. Ownership is not checked when
    /// `owner_uid` is `None`.
    pub fn open_in_directory(
        directory: PathBuf,
        owner_uid: Option<u32>,
        context: &str,
    ) -> Result<Keyring> {
        check_context(context)?;
        ensure_private_directory(&directory, owner_uid)?;

        let lock = LockFile::acquire(&directory, context)?;

        let mut cookies = read_cookie_file(&keyring_file(&directory, context))?;
        let now = now_secs();
        // Ids of purged cookies stay burned, so a client holding a stale id
        // can never accidentally match a fresh secret.
        let max_seen_id = cookies.iter().map(|c| c.id).max().unwrap_or(0);
        purge_cookies(&mut cookies, now);

        let newest = cookies.iter().map(|c| c.creation_time).max().unwrap_or(0);
        if cookies.is_empty() || now.saturating_sub(newest) >= NEW_KEY_INTERVAL.as_secs() {
            let id = max_seen_id + 1;
            trace!("minting new cookie {id} in context {context}");
            cookies.push(Cookie {
                id,
                creation_time: now,
                secret: random_hex(SECRET_HEX_LEN),
            });
        }

        if cookies.len() > MAX_COOKIES {
            cookies.sort_by_key(|c| c.creation_time);
            let excess = cookies.len() - MAX_COOKIES;
            cookies.drain(..excess);
        }

        write_cookie_file(&directory, context, &cookies)?;
        drop(lock);

        Ok(Keyring {
            directory,
            context: context.to_owned(),
            cookies,
        })
    }

    /// Load a keyring read-only, without taking the lock or rewriting.
    ///
    /// Used by the client side of cookie auth, which only ever looks up the
    /// secret the server named.
    pub fn load(username: Option<&str>, context: &str) -> Result<Keyring> {
        check_context(context)?;
        let (directory, owner_uid) = keyring_directory(username)?;
        ensure_private_directory(&directory, Some(owner_uid))?;

        let cookies = read_cookie_file(&keyring_file(&directory, context))?;

        Ok(Keyring {
            directory,
            context: context.to_owned(),
            cookies,
        })
    }

    /// Read-only load rooted at an explicit directory.
    pub fn load_in_directory(directory: PathBuf, context: &str) -> Result<Keyring> {
        check_context(context)?;
        let cookies = read_cookie_file(&keyring_file(&directory, context))?;

        Ok(Keyring {
            directory,
            context: context.to_owned(),
            cookies,
        })
    }

    /// The context this keyring was opened for.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The directory backing this keyring.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// All live cookies, oldest first.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// The id of the newest cookie that is not about to expire.
    pub fn get_best_key(&self) -> Result<u64> {
        let now = now_secs();
        self.cookies
            .iter()
            .filter(|c| now.saturating_sub(c.creation_time) < MAX_COOKIE_AGE.as_secs())
            .max_by_key(|c| c.creation_time)
            .map(|c| c.id)
            .ok_or_else(|| Error::Keyring("no usable cookie in keyring".into()))
    }

    /// The hex secret for `id`, or the empty string when the id is unknown.
    ///
    /// Unknown ids are not an error: the auth exchange hashes over the empty
    /// secret so a wrong id is indistinguishable from a wrong hash.
    pub fn get_secret(&self, id: u64) -> String {
        self.cookies
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.secret.clone())
            .unwrap_or_default()
    }
}

fn check_context(context: &str) -> Result<()> {
    if validate_context(context) {
        Ok(())
    } else {
        Err(Error::Keyring(format!("invalid cookie context `{context}`")))
    }
}

/// Resolve the keyring directory and its required owner for `username`.
fn keyring_directory(username: Option<&str>) -> Result<(PathBuf, u32)> {
    let current_uid = unsafe { libc::geteuid() } as u32;

    let (home, uid) = match username {
        None => {
            let home = userdb::home_dir()
                .ok_or_else(|| Error::Keyring("failed to determine home directory".into()))?;
            (home, current_uid)
        }
        Some(name) => {
            let entry = {
                let mut db = userdb::user_database().lock()?;
                db.user_by_name(name)?
            };
            if entry.uid == current_uid {
                // Respect $HOME for our own user, like the no-name path.
                let home = userdb::home_dir().unwrap_or(entry.homedir);
                (home, entry.uid)
            } else {
                (entry.homedir, entry.uid)
            }
        }
    };

    Ok((home.join(KEYRING_DIR), uid))
}

fn keyring_file(directory: &Path, context: &str) -> PathBuf {
    directory.join(context)
}

/// Create the keyring directory if needed and refuse to use it unless it is
/// mode 0700 and owned by the expected user.
fn ensure_private_directory(directory: &Path, owner_uid: Option<u32>) -> Result<()> {
    if !directory.exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(directory)?;
    }

    let meta = fs::metadata(directory)?;
    if !meta.is_dir() {
        return Err(Error::Keyring(format!(
            "keyring path `{}` is not a directory",
            directory.display()
        )));
    }
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(Error::Keyring(format!(
            "keyring directory `{}` is readable by group/other",
            directory.display()
        )));
    }
    if let Some(uid) = owner_uid {
        if meta.uid() != uid {
            return Err(Error::Keyring(format!(
                "keyring directory `{}` is not owned by uid {uid}",
                directory.display()
            )));
        }
    }

    Ok(())
}

fn read_cookie_file(path: &Path) -> Result<Vec<Cookie>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut cookies = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let mut split = line.split_ascii_whitespace();
        let (id, time, secret) = match (split.next(), split.next(), split.next()) {
            (Some(id), Some(time), Some(secret)) => (id, time, secret),
            _ => {
                return Err(Error::Keyring(format!(
                    "malformed cookie at {}:{}",
                    path.display(),
                    n + 1
                )))
            }
        };
        let id = id.parse().map_err(|e| {
            Error::Keyring(format!("bad cookie id at {}:{}: {e}", path.display(), n + 1))
        })?;
        let creation_time = time.parse().map_err(|e| {
            Error::Keyring(format!(
                "bad cookie timestamp at {}:{}: {e}",
                path.display(),
                n + 1
            ))
        })?;

        cookies.push(Cookie {
            id,
            creation_time,
            secret: secret.to_owned(),
        });
    }

    trace!("loaded {} cookie(s) from {}", cookies.len(), path.display());
    Ok(cookies)
}

fn purge_cookies(cookies: &mut Vec<Cookie>, now: u64) {
    cookies.retain(|c| {
        let expired = now.saturating_sub(c.creation_time) > MAX_COOKIE_AGE.as_secs();
        let from_future = c.creation_time.saturating_sub(now) > MAX_TIME_TRAVEL.as_secs();
        if expired || from_future {
            trace!("purging cookie {} (created {})", c.id, c.creation_time);
        }
        !(expired || from_future)
    });
}

/// Atomically replace the keyring file: write a private temp file next to it
/// and rename over the target.
fn write_cookie_file(directory: &Path, context: &str, cookies: &[Cookie]) -> Result<()> {
    let tmp_path = directory.join(format!("{context}.tmp-{}", random_hex(8)));
    let target = keyring_file(directory, context);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp_path)?;
    for cookie in cookies {
        writeln!(file, "{} {} {}", cookie.id, cookie.creation_time, cookie.secret)?;
    }
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, &target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

/// An exclusive advisory lock, held as `<context>.lock` next to the keyring
/// file. Dropped (and unlinked) when it goes out of scope.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(directory: &Path, context: &str) -> Result<LockFile> {
        let path = directory.join(format!("{context}.lock"));
        let attempts = (LOCK_TIMEOUT.as_millis() / LOCK_RETRY.as_millis()).max(1);

        for _ in 0..attempts {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(_) => return Ok(LockFile { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // The holder exceeded the lock timeout; assume it died and steal.
        warn!("breaking stale keyring lock {}", path.display());
        let _ = fs::remove_file(&path);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(_) => Ok(LockFile { path }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_dir(tmp: &tempfile::TempDir) -> PathBuf {
        let dir = tmp.path().join(KEYRING_DIR);
        fs::DirBuilder::new().mode(0o700).create(&dir).unwrap();
        dir
    }

    #[test]
    fn context_validation() {
        assert!(validate_context("org_freedesktop_general"));
        assert!(validate_context("abc-123_X"));
        assert!(!validate_context(""));
        assert!(!validate_context("has space"));
        assert!(!validate_context("dot.dot"));
        assert!(!validate_context("../escape"));
    }

    #[test]
    fn open_creates_a_cookie_and_reopen_is_stable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = private_dir(&tmp);

        let keyring = Keyring::open_in_directory(dir.clone(), None, "test_ctx").unwrap();
        assert_eq!(keyring.cookies().len(), 1);
        let best = keyring.get_best_key().unwrap();
        let secret = keyring.get_secret(best);
        assert_eq!(secret.len(), SECRET_HEX_LEN);

        // A fresh cookie exists, so reopening yields an equal cookie set.
        let again = Keyring::open_in_directory(dir, None, "test_ctx").unwrap();
        assert_eq!(again.cookies(), keyring.cookies());
        assert_eq!(again.get_secret(best), secret);
    }

    #[test]
    fn expired_cookies_are_purged_on_open() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = private_dir(&tmp);

        let stale = now_secs() - 1000;
        fs::write(
            dir.join("ctx"),
            format!("3 {stale} aabbccdd\n"),
        )
        .unwrap();

        let keyring = Keyring::open_in_directory(dir, None, "ctx").unwrap();
        assert!(keyring.cookies().iter().all(|c| c.id != 3));
        assert_eq!(keyring.get_secret(3), "");
        // A replacement was minted with the next id.
        assert_eq!(keyring.cookies().len(), 1);
        assert_eq!(keyring.cookies()[0].id, 4);
    }

    #[test]
    fn retention_cap_drops_oldest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = private_dir(&tmp);

        let now = now_secs();
        let mut contents = String::new();
        for id in 1..=9u64 {
            contents.push_str(&format!("{id} {} s{id}\n", now - 9 + id));
        }
        fs::write(dir.join("ctx"), contents).unwrap();

        let keyring = Keyring::open_in_directory(dir, None, "ctx").unwrap();
        assert!(keyring.cookies().len() <= MAX_COOKIES);
        // The newest survive.
        assert_eq!(keyring.get_secret(9), "s9");
        assert_eq!(keyring.get_secret(1), "");
    }

    #[test]
    fn unknown_id_yields_empty_secret() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = private_dir(&tmp);

        let keyring = Keyring::open_in_directory(dir, None, "ctx").unwrap();
        assert_eq!(keyring.get_secret(999), "");
    }

    #[test]
    fn world_readable_directory_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join(KEYRING_DIR);
        fs::DirBuilder::new().mode(0o755).create(&dir).unwrap();
        // The umask may have tightened the mode; force it open.
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(Keyring::open_in_directory(dir, None, "ctx").is_err());
    }

    #[test]
    fn stale_lock_is_broken() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = private_dir(&tmp);
        fs::write(dir.join("ctx.lock"), b"").unwrap();

        let start = std::time::Instant::now();
        let keyring = Keyring::open_in_directory(dir.clone(), None, "ctx").unwrap();
        assert!(start.elapsed() >= LOCK_TIMEOUT);
        assert_eq!(keyring.cookies().len(), 1);
        // The lock was released again.
        assert!(!dir.join("ctx.lock").exists());
    }
}
