//! Persistence store (spec §4.7): one file per session, atomic write +
//! rename, a `.most-recent` pointer, and a lock file that keeps two servers
//! from running against the same state directory at once.
//!
//! Grounded on the `plugin_config_writer`/`mcp_config_writer`
//! temp-file-then-rename idiom, generalized with an explicit `fsync` (those
//! config writers targeted files a user could safely re-save; this store
//! must survive a crash between write and rename) and a versioned envelope
//! so §4.7's read-time migration rule has somewhere to hang.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::Session;

/// Current on-disk format version. Bumped whenever [`SessionFile`]'s shape
/// changes in a way that isn't forward-compatible.
const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    version: u32,
    /// Wall-clock time of the write, for `load_all`'s startup log line; not
    /// read back into `Session` itself.
    saved_at: DateTime<Utc>,
    session: Session,
}

/// Owns the sessions directory, the `.most-recent` pointer, and the lock
/// file for one server instance.
pub struct Store {
    sessions_dir: PathBuf,
    most_recent_pointer: PathBuf,
    /// Held for the process lifetime; dropping it (server shutdown)
    /// releases the advisory lock.
    _lock_file: File,
}

impl Store {
    /// Creates the sessions directory if missing and acquires the lock
    /// file at `lock_path`. Returns [`Error::lock_held`] (exit code `3`) if
    /// another live process already holds it. `lock_path` and
    /// `most_recent_pointer` come from [`crate::config::Config`] rather
    /// than being derived from `sessions_dir` here, so there is exactly one
    /// place that decides where a server instance's lock and pointer live.
    pub fn new(sessions_dir: PathBuf, lock_path: PathBuf, most_recent_pointer: PathBuf) -> Result<Self> {
        fs::create_dir_all(&sessions_dir)
            .map_err(|e| Error::fatal(format!("cannot create sessions directory: {e}")))?;
        let lock_file = acquire_lock(&lock_path)?;
        Ok(Self { sessions_dir, most_recent_pointer, _lock_file: lock_file })
    }

    fn session_path(&self, name: &str) -> PathBuf {
        self.sessions_dir.join(name)
    }

    /// Atomically writes `session`'s state: write to a temp file in the
    /// same directory, `fsync`, then rename over the target (spec §4.7
    /// "Write discipline" — no partial state is ever observable).
    pub fn save(&self, session: &Session) -> Result<()> {
        let envelope = SessionFile { version: CURRENT_VERSION, saved_at: Utc::now(), session: session.clone() };
        let body = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| Error::fatal(format!("failed to serialize session {}: {e}", session.name)))?;
        atomic_write(&self.session_path(&session.name), &body)?;
        self.set_most_recent(&session.name)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.session_path(name);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::fatal(format!("cannot remove session file: {e}")))?;
        }
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_path = self.session_path(old);
        let new_path = self.session_path(new);
        fs::rename(&old_path, &new_path)
            .map_err(|e| Error::fatal(format!("cannot rename session file: {e}")))?;
        self.set_most_recent(new)
    }

    fn set_most_recent(&self, name: &str) -> Result<()> {
        atomic_write(&self.most_recent_pointer, name.as_bytes())
    }

    pub fn most_recent(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.most_recent_pointer) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::fatal(format!("cannot read most-recent pointer: {e}"))),
        }
    }

    /// Loads every session file in the directory, upgrading older format
    /// versions in memory. An unknown *future* version is fatal (spec
    /// §4.7): the server refuses to run rather than silently discard state
    /// it doesn't understand.
    pub fn load_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(Error::fatal(format!("cannot read sessions directory: {e}"))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::fatal(format!("cannot read directory entry: {e}")))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if name.starts_with('.') {
                continue;
            }
            sessions.push(self.load_one(&path)?);
        }
        Ok(sessions)
    }

    fn load_one(&self, path: &Path) -> Result<Session> {
        let body = fs::read_to_string(path)
            .map_err(|e| Error::fatal(format!("cannot read session file {}: {e}", path.display())))?;
        let envelope: SessionFile = serde_json::from_str(&body)
            .map_err(|e| Error::fatal(format!("corrupt session file {}: {e}", path.display())))?;
        if envelope.version > CURRENT_VERSION {
            return Err(Error::fatal(format!(
                "session file {} is format version {}, newer than this build supports ({})",
                path.display(),
                envelope.version,
                CURRENT_VERSION
            )));
        }
        log::debug!("loaded session {} saved at {}", envelope.session.name, envelope.saved_at.to_rfc3339());
        // No older versions exist yet; when one does, upgrade here before
        // returning `envelope.session`.
        Ok(envelope.session)
    }
}

fn atomic_write(target: &Path, body: &[u8]) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        std::process::id()
    ));

    let mut tmp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| Error::fatal(format!("cannot create temp file {}: {e}", tmp_path.display())))?;
    tmp.write_all(body)
        .map_err(|e| Error::fatal(format!("cannot write temp file {}: {e}", tmp_path.display())))?;
    tmp.sync_all()
        .map_err(|e| Error::fatal(format!("fsync failed on {}: {e}", tmp_path.display())))?;
    drop(tmp);

    fs::rename(&tmp_path, target)
        .map_err(|e| Error::fatal(format!("cannot rename {} to {}: {e}", tmp_path.display(), target.display())))?;
    Ok(())
}

/// Acquires an exclusive, non-blocking `flock` on `path`, creating it if
/// necessary. The lock is released when the returned `File` is dropped
/// (process exit or explicit `drop`), so a crashed server never leaves a
/// stale lock behind.
fn acquire_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| Error::fatal(format!("cannot open lock file {}: {e}", path.display())))?;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(Error::lock_held(format!(
                "another prise server already holds the lock at {}",
                path.display()
            )));
        }
        return Err(Error::fatal(format!("cannot lock {}: {err}", path.display())));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Node, Pane, PaneId, PtyId, SpawnAnchor, Tab, TabId};

    fn sample_session(name: &str) -> Session {
        // Built through the public API rather than struct literal: `Session`
        // hides its id counters behind `pub(crate)`-equivalent privacy in
        // `session::manager`, so round-trip through `SessionManager` instead.
        let _ = (Node::Pane(Pane { id: PaneId(1), pty: PtyId(1) }), Tab::new(TabId(1)), SpawnAnchor::FirstPane);
        serde_json::from_value(serde_json::json!({
            "name": name,
            "tabs": [],
            "active_tab": 0,
            "focused_pane": null,
            "next_pane_id": 1,
            "next_split_id": 1,
            "next_tab_id": 1
        }))
        .unwrap()
    }

    fn test_store(dir: &std::path::Path) -> Result<Store> {
        Store::new(dir.join("sessions"), dir.join("test.lock"), dir.join("sessions").join(".most-recent"))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).unwrap();
        let session = sample_session("work");
        store.save(&session).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "work");
        assert_eq!(store.most_recent().unwrap(), Some("work".to_string()));
    }

    #[test]
    fn second_store_on_same_dir_fails_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _first = test_store(dir.path()).unwrap();
        let second = test_store(dir.path());
        assert!(matches!(second, Err(e) if e.lock_held));
    }

    #[test]
    fn unknown_future_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sessions_dir = dir.path().join("sessions");
        fs::create_dir_all(&sessions_dir).unwrap();
        fs::write(
            sessions_dir.join("future"),
            serde_json::json!({
                "version": CURRENT_VERSION + 1,
                "saved_at": Utc::now(),
                "session": sample_session("future")
            })
            .to_string(),
        )
        .unwrap();

        let store = test_store(dir.path()).unwrap();
        assert!(store.load_all().is_err());
    }
}
