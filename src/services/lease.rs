//! File-backed named leases shared by independent processes.
//!
//! A lease is a JSON file `<lock_dir>/<name>.lease` that is created with
//! `hard_link`, which fails atomically when the name is taken and never
//! exposes a half-written record. A lease whose holder stopped refreshing it
//! for longer than the TTL, and whose process is not known to be alive, is
//! abandoned and may be reclaimed by anyone.
//!
//! A pid alone does not prove liveness: a restarted daemon (pid 1 in a
//! container) often gets the pid of its crashed predecessor. A record with our
//! own pid is live only if this process issued its holder id.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Contents of a lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub holder_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            holder_id: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: now,
            refreshed_at: now,
        }
    }

    /// Time since the holder last refreshed, zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.refreshed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Gone,
    Unknown,
}

/// Holder ids issued by this process and not yet released.
fn issued() -> MutexGuard<'static, HashSet<Uuid>> {
    static ISSUED: OnceLock<Mutex<HashSet<Uuid>>> = OnceLock::new();
    ISSUED
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn holder_liveness(record: &LeaseRecord) -> Liveness {
    if record.pid == std::process::id() {
        if issued().contains(&record.holder_id) {
            return Liveness::Alive;
        }
        return Liveness::Gone;
    }
    if cfg!(target_os = "linux") {
        if Path::new("/proc").join(record.pid.to_string()).exists() {
            Liveness::Alive
        } else {
            Liveness::Gone
        }
    } else {
        Liveness::Unknown
    }
}

/// Acquires, checks and releases leases under one directory.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lease"))
    }

    /// Non-blocking acquire. `None` means a live holder has it.
    ///
    /// The returned guard releases the lease when dropped.
    pub fn acquire(&self, name: &str) -> Result<Option<LeaseGuard>, LeaseError> {
        fs::create_dir_all(&self.dir).map_err(|e| LeaseError::io(&self.dir, e))?;

        // Second pass only after removing a stale or vanished lease.
        for _ in 0..2 {
            let record = LeaseRecord::new(name);
            match self.create(&record) {
                Ok(()) => {
                    issued().insert(record.holder_id);
                    debug!(lease = name, holder = %record.holder_id, "Lease acquired");
                    return Ok(Some(LeaseGuard {
                        manager: self.clone(),
                        record,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LeaseError::io(&self.path(name), e)),
            }

            match self.holder(name)? {
                None => continue,
                Some(current) if self.is_stale(&current) => {
                    if !self.reclaim(&current)? {
                        return Ok(None);
                    }
                }
                Some(current) => {
                    debug!(lease = name, pid = current.pid, "Lease held by another holder");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Whether a live (non-stale) holder has `name`. Never acquires.
    pub fn is_locked(&self, name: &str) -> Result<bool, LeaseError> {
        Ok(self
            .holder(name)?
            .is_some_and(|record| !self.is_stale(&record)))
    }

    /// Current record of `name`, stale or not.
    ///
    /// An unparsable file is reported with a nil holder and its modification
    /// time, so it still expires through the TTL.
    pub fn holder(&self, name: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let path = self.path(name);
        read_record(&path, name)
    }

    /// Drop `name` if this process holds it.
    pub fn release(&self, name: &str) -> Result<bool, LeaseError> {
        match self.holder(name)? {
            Some(record) if record.pid == std::process::id() && holder_liveness(&record) == Liveness::Alive => {
                self.remove_if_held(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn is_stale(&self, record: &LeaseRecord) -> bool {
        record.age() > self.ttl && holder_liveness(record) != Liveness::Alive
    }

    fn create(&self, record: &LeaseRecord) -> io::Result<()> {
        let temp = self.temp_path(&record.name);
        fs::write(&temp, serde_json::to_vec(record)?)?;
        let linked = fs::hard_link(&temp, self.path(&record.name));
        let _ = fs::remove_file(&temp);
        linked
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{name}.{}.tmp", Uuid::new_v4()))
    }

    /// Move an abandoned lease aside. Returns false if someone else got there first.
    fn reclaim(&self, stale: &LeaseRecord) -> Result<bool, LeaseError> {
        let path = self.path(&stale.name);
        let tombstone = self.dir.join(format!(".{}.{}.stale", stale.name, Uuid::new_v4()));
        match fs::rename(&path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(LeaseError::io(&path, e)),
        }

        let moved = read_record(&tombstone, &stale.name)?;
        if moved.as_ref().map(|r| r.holder_id) != Some(stale.holder_id) {
            // We displaced a fresh lease taken after our staleness check; put it back.
            if let Err(e) = fs::hard_link(&tombstone, &path) {
                warn!(lease = %stale.name, error = %e, "Could not restore displaced lease");
            }
            let _ = fs::remove_file(&tombstone);
            return Ok(false);
        }

        let _ = fs::remove_file(&tombstone);
        info!(
            lease = %stale.name,
            pid = stale.pid,
            age_secs = stale.age().as_secs(),
            "Reclaimed abandoned lease"
        );
        Ok(true)
    }

    fn refresh(&self, record: &mut LeaseRecord) -> Result<(), LeaseError> {
        match self.holder(&record.name)? {
            Some(current) if current.holder_id == record.holder_id => {}
            _ => {
                return Err(LeaseError::Lost {
                    name: record.name.clone(),
                })
            }
        }
        record.refreshed_at = Utc::now();
        let path = self.path(&record.name);
        let temp = self.temp_path(&record.name);
        let body = serde_json::to_vec(record)?;
        fs::write(&temp, body).map_err(|e| LeaseError::io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| LeaseError::io(&path, e))
    }

    fn remove_if_held(&self, record: &LeaseRecord) -> Result<(), LeaseError> {
        issued().remove(&record.holder_id);
        let path = self.path(&record.name);
        match self.holder(&record.name)? {
            Some(current) if current.holder_id == record.holder_id => {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(LeaseError::io(&path, e)),
                }
                debug!(lease = %record.name, "Lease released");
            }
            Some(current) => {
                warn!(lease = %record.name, pid = current.pid, "Lease was taken over before release");
            }
            None => {}
        }
        Ok(())
    }
}

fn read_record(path: &Path, name: &str) -> Result<Option<LeaseRecord>, LeaseError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LeaseError::io(path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(lease = name, error = %e, "Unreadable lease file");
            let modified = fs::metadata(path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(Some(LeaseRecord {
                name: name.to_string(),
                holder_id: Uuid::nil(),
                pid: 0,
                acquired_at: modified,
                refreshed_at: modified,
            }))
        }
    }
}

/// Scoped ownership of a lease; released on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    manager: LeaseManager,
    record: LeaseRecord,
    released: bool,
}

impl LeaseGuard {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// Bump the timestamp so other processes keep seeing the lease as live.
    pub fn refresh(&mut self) -> Result<(), LeaseError> {
        self.manager.refresh(&mut self.record)
    }

    /// Keep refreshing in the background until the returned handle is dropped.
    pub fn heartbeat(&self, every: Duration) -> Heartbeat {
        let manager = self.manager.clone();
        let mut record = self.record.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.refresh(&mut record) {
                    warn!(lease = %record.name, error = %e, "Lease heartbeat failed");
                    if matches!(e, LeaseError::Lost { .. }) {
                        break;
                    }
                }
            }
        });
        Heartbeat { task }
    }

    pub fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        self.manager.remove_if_held(&self.record)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.remove_if_held(&self.record) {
            warn!(lease = %self.record.name, error = %e, "Failed to release lease");
        }
    }
}

/// Background refresher started by [`LeaseGuard::heartbeat`].
#[derive(Debug)]
pub struct Heartbeat {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Lease serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lease {name} is no longer held by this process")]
    Lost { name: String },
}

impl LeaseError {
    fn io(path: &Path, source: io::Error) -> Self {
        LeaseError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEAD_PID: u32 = 2_000_000_000;

    fn manager(ttl: Duration) -> (tempfile::TempDir, LeaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let leases = LeaseManager::new(dir.path().join("locks"), ttl);
        (dir, leases)
    }

    fn plant(leases: &LeaseManager, name: &str, pid: u32, age: Duration) -> LeaseRecord {
        fs::create_dir_all(&leases.dir).unwrap();
        let at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        let record = LeaseRecord {
            name: name.to_string(),
            holder_id: Uuid::new_v4(),
            pid,
            acquired_at: at,
            refreshed_at: at,
        };
        fs::write(leases.path(name), serde_json::to_vec(&record).unwrap()).unwrap();
        record
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        let guard = leases.acquire("background_worker").unwrap().expect("first acquire");
        assert!(leases.acquire("background_worker").unwrap().is_none());
        assert!(leases.is_locked("background_worker").unwrap());
        assert!(!leases.is_locked("interactive_app").unwrap());

        guard.release().unwrap();
        assert!(!leases.is_locked("background_worker").unwrap());
        assert!(leases.acquire("background_worker").unwrap().is_some());
    }

    #[test]
    fn test_guard_drop_releases() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        {
            let _guard = leases.acquire("interactive_app").unwrap().unwrap();
            assert!(leases.is_locked("interactive_app").unwrap());
        }
        assert!(!leases.is_locked("interactive_app").unwrap());
    }

    #[test]
    fn test_abandoned_lease_is_reclaimed() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        let stale = plant(&leases, "background_worker", DEAD_PID, Duration::from_secs(600));

        assert!(!leases.is_locked("background_worker").unwrap());
        let guard = leases.acquire("background_worker").unwrap().expect("reclaim");
        assert_ne!(guard.record().holder_id, stale.holder_id);
        assert_eq!(guard.record().pid, std::process::id());
    }

    #[test]
    fn test_lease_left_by_earlier_process_with_our_pid_is_reclaimed() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        let stale = plant(&leases, "background_worker", std::process::id(), Duration::from_secs(600));

        assert!(leases.is_stale(&stale));
        assert!(!leases.is_locked("background_worker").unwrap());
        let guard = leases.acquire("background_worker").unwrap().expect("reclaim");
        assert_ne!(guard.record().holder_id, stale.holder_id);
    }

    #[test]
    fn test_recent_lease_with_our_pid_is_kept_until_ttl() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        plant(&leases, "background_worker", std::process::id(), Duration::from_secs(5));
        assert!(leases.is_locked("background_worker").unwrap());
        assert!(!leases.release("background_worker").unwrap());
    }

    #[test]
    fn test_own_live_guard_never_goes_stale() {
        let (_dir, leases) = manager(Duration::ZERO);
        let guard = leases.acquire("interactive_app").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(!leases.is_stale(guard.record()));
        assert!(leases.is_locked("interactive_app").unwrap());
        assert!(leases.acquire("interactive_app").unwrap().is_none());

        let record = guard.record().clone();
        guard.release().unwrap();
        // Once released, a record carrying that holder id is no longer ours.
        assert!(!issued().contains(&record.holder_id));
    }

    #[test]
    fn test_recent_lease_of_dead_holder_is_kept_until_ttl() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        plant(&leases, "background_worker", DEAD_PID, Duration::from_secs(5));
        assert!(leases.is_locked("background_worker").unwrap());
    }

    #[test]
    fn test_corrupt_lease_expires_by_mtime() {
        let (_dir, leases) = manager(Duration::ZERO);
        fs::create_dir_all(&leases.dir).unwrap();
        fs::write(leases.path("interactive_app"), b"{ truncated").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let record = leases.holder("interactive_app").unwrap().unwrap();
        assert!(record.holder_id.is_nil());
        assert!(leases.acquire("interactive_app").unwrap().is_some());
    }

    #[test]
    fn test_refresh_detects_takeover() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        let mut guard = leases.acquire("background_worker").unwrap().unwrap();
        let before = guard.record().refreshed_at;
        std::thread::sleep(Duration::from_millis(5));
        guard.refresh().unwrap();
        assert!(guard.record().refreshed_at > before);

        plant(&leases, "background_worker", DEAD_PID, Duration::ZERO);
        assert!(matches!(guard.refresh(), Err(LeaseError::Lost { .. })));
        // Dropping must not delete the other holder's lease.
        drop(guard);
        assert!(leases.holder("background_worker").unwrap().is_some());
    }

    #[test]
    fn test_release_by_name_only_own_lease() {
        let (_dir, leases) = manager(Duration::from_secs(60));
        plant(&leases, "interactive_app", DEAD_PID, Duration::ZERO);
        assert!(!leases.release("interactive_app").unwrap());

        let guard = leases.acquire("background_worker").unwrap().unwrap();
        std::mem::forget(guard);
        assert!(leases.release("background_worker").unwrap());
        assert!(!leases.is_locked("background_worker").unwrap());
    }
}
