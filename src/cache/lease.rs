//! Cross-process leases guarding execution of one checksum.
//!
//! A lease is a `<checksum>.lock` file created with create-if-absent
//! semantics. The holder refreshes `heartbeat_at` in the background; a lease
//! whose heartbeat is older than the configured threshold, or whose holder
//! process is gone from this host, can be reclaimed by anyone.
//!
//! Reclaimers serialize on a `<checksum>.reclaim` guard file, so a stale
//! lock is only ever removed by one process, after re-reading it under the
//! guard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{CacheError, CacheResult};
use super::Checksum;
use crate::config::CacheConfig;

/// Bound on reclaim races before giving up
const MAX_ACQUIRE_ATTEMPTS: usize = 8;

/// A reclaim guard older than this was left by a crashed reclaimer
const RECLAIM_GUARD_STALE: Duration = Duration::from_secs(30);

/// Metadata stored in the lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub checksum: Checksum,
    pub token: Uuid,
    pub process_id: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn new(checksum: Checksum) -> Self {
        let now = Utc::now();
        Self {
            checksum,
            token: Uuid::new_v4(),
            process_id: std::process::id(),
            hostname: get_hostname(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Human-readable holder description
    pub fn describe(&self) -> String {
        format!(
            "PID {} on {} (acquired {}, last heartbeat {})",
            self.process_id,
            self.hostname,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.heartbeat_at.format("%H:%M:%S UTC")
        )
    }

    /// Whether the holder can be presumed dead
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        let idle = now
            .signed_duration_since(self.heartbeat_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle > stale_after {
            return true;
        }
        self.hostname == get_hostname() && !is_process_running(self.process_id)
    }
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Check if a process with given PID is running on this host
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Outcome of one acquisition attempt
#[derive(Debug)]
pub enum Acquire {
    Acquired(Lease),
    Held(LeaseRecord),
}

/// Exclusive right to execute and commit one checksum
#[derive(Debug)]
pub struct Lease {
    checksum: Checksum,
    path: PathBuf,
    token: Uuid,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl Lease {
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop heartbeating and remove the lock file if it is still ours
    pub async fn release(mut self) -> CacheResult<()> {
        self.released = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        match read_record(&self.path).await {
            Ok(Some(record)) if record.token == self.token => {
                tokio::fs::remove_file(&self.path)
                    .await
                    .or_else(ignore_not_found)
                    .map_err(|e| CacheError::io(&self.path, e))?;
                debug!("Released lease for {}", self.checksum.short());
                Ok(())
            }
            Ok(Some(record)) => {
                warn!(
                    "Lease for {} was taken over by {}; leaving it in place",
                    self.checksum.short(),
                    record.describe()
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str::<LeaseRecord>(&content).ok())
            .is_some_and(|record| record.token == self.token);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to release lease for {}: {}", self.checksum.short(), e);
            }
        }
    }
}

/// Try to take the lease at `path`, reclaiming it when stale.
pub(crate) async fn try_acquire(
    path: &Path,
    checksum: &Checksum,
    settings: &CacheConfig,
) -> CacheResult<Acquire> {
    for _ in 0..MAX_ACQUIRE_ATTEMPTS {
        let record = LeaseRecord::new(checksum.clone());

        if create_new(path, &record)? {
            debug!("Acquired lease for {}", checksum.short());
            let heartbeat = spawn_heartbeat(
                path.to_path_buf(),
                record.token,
                settings.heartbeat_interval,
            );
            return Ok(Acquire::Acquired(Lease {
                checksum: checksum.clone(),
                path: path.to_path_buf(),
                token: record.token,
                heartbeat: Some(heartbeat),
                released: false,
            }));
        }

        match read_record(path).await {
            // Released between our create and read
            Ok(None) => continue,
            Ok(Some(existing)) => {
                if !existing.is_stale(settings.stale_after, Utc::now()) {
                    return Ok(Acquire::Held(existing));
                }
                warn!(
                    "Reclaiming stale lease for {} held by {}",
                    checksum.short(),
                    existing.describe()
                );
                if !reclaim(path, Some(existing.token), settings).await? {
                    // Another process is reclaiming; treat the lease as held
                    return Ok(Acquire::Held(existing));
                }
            }
            Err(CacheError::Serialization(e)) => {
                warn!(
                    "Reclaiming unreadable lease for {}: {}",
                    checksum.short(),
                    e
                );
                if !reclaim(path, None, settings).await? {
                    tokio::time::sleep(settings.wait_poll_interval).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(CacheError::lease(format!(
        "gave up acquiring lease for {} after {} attempts",
        checksum.short(),
        MAX_ACQUIRE_ATTEMPTS
    )))
}

/// Atomically create the lock file; `false` when it already exists
fn create_new(path: &Path, record: &LeaseRecord) -> CacheResult<bool> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::lease(format!("{} has no parent", path.display())))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut temp, record)?;
    temp.flush().map_err(|e| CacheError::io(temp.path(), e))?;

    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(CacheError::io(path, e.error)),
    }
}

/// Exclusive right to remove a stale lock, held as `<checksum>.reclaim`
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    /// `None` while another reclaimer holds the guard
    fn try_take(lock_path: &Path) -> CacheResult<Option<Self>> {
        let path = lock_path.with_extension("reclaim");
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Some(Self { path })),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !is_abandoned_guard(&path) {
                        return Ok(None);
                    }
                    warn!("Breaking abandoned reclaim guard {}", path.display());
                    std::fs::remove_file(&path)
                        .or_else(ignore_not_found)
                        .map_err(|e| CacheError::io(&path, e))?;
                }
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }
        Ok(None)
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove reclaim guard {}: {}", self.path.display(), e);
            }
        }
    }
}

fn is_abandoned_guard(path: &Path) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return true,
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > RECLAIM_GUARD_STALE)
}

/// Remove a stale lock under the reclaim guard.
///
/// Returns `false` when another reclaimer holds the guard. Under the guard
/// the lock can only change by its own holder, so it is removed only if it
/// still carries the `expected` token and is still stale.
async fn reclaim(path: &Path, expected: Option<Uuid>, settings: &CacheConfig) -> CacheResult<bool> {
    let Some(_guard) = ReclaimGuard::try_take(path)? else {
        return Ok(false);
    };

    let still_stale = match read_record(path).await {
        Ok(Some(record)) => {
            Some(record.token) == expected && record.is_stale(settings.stale_after, Utc::now())
        }
        Ok(None) => return Ok(true),
        Err(CacheError::Serialization(_)) => expected.is_none(),
        Err(e) => return Err(e),
    };

    if still_stale {
        tokio::fs::remove_file(path)
            .await
            .or_else(ignore_not_found)
            .map_err(|e| CacheError::io(path, e))?;
    } else {
        debug!("Lease {} changed hands before reclaim; leaving it", path.display());
    }
    Ok(true)
}

pub(crate) async fn read_record(path: &Path) -> CacheResult<Option<LeaseRecord>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn spawn_heartbeat(path: PathBuf, token: Uuid, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let mut record = match read_record(&path).await {
                Ok(Some(record)) if record.token == token => record,
                Ok(_) => {
                    info!("Lease {} is no longer ours; stopping heartbeat", path.display());
                    return;
                }
                Err(e) => {
                    warn!("Failed to read lease {} for heartbeat: {}", path.display(), e);
                    continue;
                }
            };

            record.heartbeat_at = Utc::now();
            if let Err(e) = rewrite(&path, &record) {
                warn!("Failed to refresh lease {}: {}", path.display(), e);
            }
        }
    })
}

fn rewrite(path: &Path, record: &LeaseRecord) -> CacheResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::lease(format!("{} has no parent", path.display())))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut temp, record)?;
    temp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

fn ignore_not_found(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checksum() -> Checksum {
        Checksum::of_bytes(b"lease-test")
    }

    fn settings() -> CacheConfig {
        CacheConfig {
            stale_after: Duration::from_secs(600),
            heartbeat_interval: Duration::from_millis(50),
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_second_acquire_sees_holder() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        let first = try_acquire(&path, &checksum(), &settings()).await.unwrap();
        let Acquire::Acquired(lease) = first else {
            panic!("expected lease");
        };

        match try_acquire(&path, &checksum(), &settings()).await.unwrap() {
            Acquire::Held(record) => {
                assert_eq!(record.token, lease.token());
                assert_eq!(record.process_id, std::process::id());
            }
            Acquire::Acquired(_) => panic!("lease acquired twice"),
        }

        lease.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_releases_lock_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        {
            let acquired = try_acquire(&path, &checksum(), &settings()).await.unwrap();
            assert!(matches!(acquired, Acquire::Acquired(_)));
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        let mut stale = LeaseRecord::new(checksum());
        stale.heartbeat_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        match try_acquire(&path, &checksum(), &settings()).await.unwrap() {
            Acquire::Acquired(lease) => assert_ne!(lease.token(), stale.token),
            Acquire::Held(_) => panic!("stale lease was not reclaimed"),
        }
    }

    #[tokio::test]
    async fn test_dead_local_holder_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        let mut orphan = LeaseRecord::new(checksum());
        orphan.process_id = 999_999_999;
        std::fs::write(&path, serde_json::to_string(&orphan).unwrap()).unwrap();

        let acquired = try_acquire(&path, &checksum(), &settings()).await.unwrap();
        assert!(matches!(acquired, Acquire::Acquired(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        let Acquire::Acquired(lease) = try_acquire(&path, &checksum(), &settings()).await.unwrap()
        else {
            panic!("expected lease");
        };
        let before = read_record(&path).await.unwrap().unwrap().heartbeat_at;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = read_record(&path).await.unwrap().unwrap().heartbeat_at;

        assert!(after > before);
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reclaim_leaves_a_replaced_lease() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        // The stale record seen earlier has since been replaced by a fresh holder
        let mut fresh = LeaseRecord::new(checksum());
        fresh.heartbeat_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, serde_json::to_string(&fresh).unwrap()).unwrap();

        let seen_earlier = Uuid::new_v4();
        assert!(reclaim(&path, Some(seen_earlier), &settings()).await.unwrap());
        assert_eq!(read_record(&path).await.unwrap().unwrap().token, fresh.token);
        assert!(!path.with_extension("reclaim").exists());
    }

    #[tokio::test]
    async fn test_busy_reclaim_guard_blocks_takeover() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");

        let mut stale = LeaseRecord::new(checksum());
        stale.heartbeat_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();
        std::fs::write(path.with_extension("reclaim"), "").unwrap();

        match try_acquire(&path, &checksum(), &settings()).await.unwrap() {
            Acquire::Held(record) => assert_eq!(record.token, stale.token),
            Acquire::Acquired(_) => panic!("reclaimed while another reclaimer held the guard"),
        }
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_abandoned_reclaim_guard_is_broken() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.lock");
        let guard = path.with_extension("reclaim");

        let mut stale = LeaseRecord::new(checksum());
        stale.heartbeat_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();
        std::fs::write(&guard, "").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&guard)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(300))
            .unwrap();

        let acquired = try_acquire(&path, &checksum(), &settings()).await.unwrap();
        assert!(matches!(acquired, Acquire::Acquired(_)));
        assert!(!guard.exists());
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
