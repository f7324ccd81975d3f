//! The DBUS_COOKIE_SHA1 keyring: per-context cookie files shared between
//! processes under `~/.dbus-keyrings`.
//!
//! Updates follow the lockfile-and-rename discipline: take `<ctx>.lock`
//! with O_CREAT|O_EXCL, write a temporary, rename it over the target, drop
//! the lock.  Reads go straight to the file; rename keeps them atomic.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CONTEXT: &str = "org_freedesktop_general";

/// Cookies older than this, or dated in the future, are discarded; a fresh
/// cookie is minted at most this often.
pub const COOKIE_LIFETIME_SECS: i64 = 300;

const LOCK_ATTEMPTS: u32 = 32;
const LOCK_RETRY: Duration = Duration::from_millis(250);
const COOKIE_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub id: u32,
    /// Unix seconds at mint time.
    pub created: i64,
    /// Hex-encoded random bytes.
    pub value: String,
}

impl Cookie {
    fn parse_line(line: &str) -> Option<Cookie> {
        let mut fields = line.split_whitespace();
        let id = fields.next()?.parse().ok()?;
        let created = fields.next()?.parse().ok()?;
        let value = fields.next()?;
        if fields.next().is_some() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Cookie {
            id,
            created,
            value: value.to_string(),
        })
    }

    fn is_fresh(&self, now: i64) -> bool {
        self.created <= now && now - self.created < COOKIE_LIFETIME_SECS
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn check_context(context: &str) -> io::Result<()> {
    let ok = !context.is_empty()
        && context
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\');
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "bad keyring context name",
        ))
    }
}

pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    pub fn new(dir: PathBuf) -> Keyring {
        Keyring { dir }
    }

    /// `$HOME/.dbus-keyrings`.
    pub fn with_default_dir() -> io::Result<Keyring> {
        let home = std::env::var_os("HOME").ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "HOME is not set")
        })?;
        let mut dir = PathBuf::from(home);
        dir.push(".dbus-keyrings");
        Ok(Keyring::new(dir))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        // The directory must not be readable by anyone else.
        match std::fs::DirBuilder::new().mode(0o700).create(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All still-fresh cookies for `context`.
    pub async fn load(&self, context: &str) -> io::Result<Vec<Cookie>> {
        check_context(context)?;
        let path = self.dir.join(context);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let now = now_secs();
        Ok(contents
            .lines()
            .filter_map(Cookie::parse_line)
            .filter(|c| c.is_fresh(now))
            .collect())
    }

    /// The cookie with the given id, if present and fresh.
    pub async fn lookup(&self, context: &str, id: u32) -> io::Result<Option<Cookie>> {
        Ok(self.load(context).await?.into_iter().find(|c| c.id == id))
    }

    /// Return a fresh cookie for `context`, minting one if every stored
    /// cookie has expired.  Expired cookies are purged from the file.
    pub async fn get_or_create(&self, context: &str) -> io::Result<Cookie> {
        check_context(context)?;
        self.ensure_dir()?;
        let lock = self.lock(context).await?;
        let result = self.rewrite(context).await;
        let _ = tokio::fs::remove_file(&lock).await;
        result
    }

    async fn lock(&self, context: &str) -> io::Result<PathBuf> {
        let path = self.dir.join(format!("{context}.lock"));
        for attempt in 0..LOCK_ATTEMPTS {
            match try_create_lock(&path).await {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt + 1 == LOCK_ATTEMPTS {
                        // The holder is presumed dead; break the lock and
                        // try once more.
                        let _ = tokio::fs::remove_file(&path).await;
                        try_create_lock(&path).await?;
                        return Ok(path);
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "keyring lock never became free",
        ))
    }

    async fn rewrite(&self, context: &str) -> io::Result<Cookie> {
        let mut cookies = self.load(context).await?;
        let now = now_secs();
        let chosen = match cookies.iter().max_by_key(|c| c.created) {
            Some(newest) => newest.clone(),
            None => {
                let next_id = cookies.iter().map(|c| c.id).max().unwrap_or(0).wrapping_add(1);
                let mut bytes = [0u8; COOKIE_BYTES];
                rand::thread_rng().fill_bytes(&mut bytes);
                let minted = Cookie {
                    id: next_id,
                    created: now,
                    value: hex::encode(bytes),
                };
                cookies.push(minted.clone());
                minted
            }
        };

        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        let tmp = self.dir.join(format!("{context}.{}", hex::encode(suffix)));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .await?;
        let mut body = String::new();
        for c in &cookies {
            body.push_str(&format!("{} {} {}\n", c.id, c.created, c.value));
        }
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.dir.join(context)).await?;
        Ok(chosen)
    }
}

async fn try_create_lock(path: &std::path::Path) -> io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await
        .map(|_| ())
}
