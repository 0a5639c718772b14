//! Content-addressed result cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<checksum>/_result.json     serialized result and output bindings
//! <root>/<checksum>/_stdout.txt      captured stdout
//! <root>/<checksum>/_stderr.txt      captured stderr
//! <root>/<checksum>/_complete        completion marker, written last
//! <root>/<checksum>.lock             lease record while someone executes
//! <root>/<checksum>.reclaim          guard held while a stale lease is removed
//! <root>/.staging/                   commits in progress
//! <root>/.work/                      per-instance working directories
//! ```
//!
//! An entry without `_complete` is not committed, whatever else it holds.
//! Entries are never modified once committed.

mod checksum;
pub mod error;
mod lease;

pub use checksum::Checksum;
pub use error::{CacheError, CacheResult};
pub use lease::{is_process_running, Lease, LeaseRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::execution::ExecutionResult;
use lease::Acquire;

const RESULT_FILE: &str = "_result.json";
const STDOUT_FILE: &str = "_stdout.txt";
const STDERR_FILE: &str = "_stderr.txt";
const COMPLETE_MARKER: &str = "_complete";
const STAGING_DIR: &str = ".staging";
const WORK_DIR: &str = ".work";

/// A committed cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub checksum: Checksum,
    pub dir: PathBuf,
    pub committed_at: DateTime<Utc>,
    pub result: ExecutionResult,
}

impl CacheEntry {
    pub fn into_result(self) -> ExecutionResult {
        self.result
    }
}

/// Outcome of claiming a checksum
#[derive(Debug)]
pub enum Claim {
    /// Already committed; nothing to run
    Cached(CacheEntry),
    /// Caller must execute and commit
    Acquired(Lease),
    /// Someone else is executing it
    Busy(LeaseRecord),
}

#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
    settings: CacheConfig,
}

impl Cache {
    /// No filesystem access happens until the first claim or commit
    pub fn new(root: impl Into<PathBuf>, settings: CacheConfig) -> Self {
        Self {
            root: root.into(),
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &CacheConfig {
        &self.settings
    }

    pub fn entry_dir(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(checksum.as_str())
    }

    fn lock_path(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(format!("{}.lock", checksum))
    }

    /// Read-only lookup; safe without holding a lease
    pub fn lookup(&self, checksum: &Checksum) -> CacheResult<Option<CacheEntry>> {
        let dir = self.entry_dir(checksum);
        let marker = dir.join(COMPLETE_MARKER);

        let committed_at = match std::fs::read_to_string(&marker) {
            Ok(content) => DateTime::parse_from_rfc3339(content.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    CacheError::corrupted(format!("bad marker in {}: {}", dir.display(), e))
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&marker, e)),
        };

        let result_path = dir.join(RESULT_FILE);
        let content = std::fs::read_to_string(&result_path).map_err(|e| {
            CacheError::corrupted(format!(
                "{} is marked complete but unreadable: {}",
                result_path.display(),
                e
            ))
        })?;
        let result: ExecutionResult = serde_json::from_str(&content)?;

        Ok(Some(CacheEntry {
            checksum: checksum.clone(),
            dir,
            committed_at,
            result,
        }))
    }

    /// Claim the right to execute `checksum`, or report who holds it
    pub async fn claim(&self, checksum: &Checksum) -> CacheResult<Claim> {
        if let Some(entry) = self.lookup(checksum)? {
            return Ok(Claim::Cached(entry));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::io(&self.root, e))?;

        match lease::try_acquire(&self.lock_path(checksum), checksum, &self.settings).await? {
            Acquire::Acquired(lease) => {
                // Committed between our lookup and the lease
                if let Some(entry) = self.lookup(checksum)? {
                    lease.release().await?;
                    return Ok(Claim::Cached(entry));
                }
                Ok(Claim::Acquired(lease))
            }
            Acquire::Held(record) => Ok(Claim::Busy(record)),
        }
    }

    /// Wait for a foreign lease to resolve.
    ///
    /// Returns `Cached` once the holder commits, or `Acquired` when the
    /// holder went away without committing and the lease became ours.
    pub async fn wait_for(&self, checksum: &Checksum) -> CacheResult<Claim> {
        let started = Instant::now();
        loop {
            match self.claim(checksum).await? {
                Claim::Busy(record) => {
                    if let Some(limit) = self.settings.claim_timeout {
                        if started.elapsed() >= limit {
                            return Err(CacheError::Timeout(limit));
                        }
                    }
                    debug!(
                        "Waiting on {} held by {}",
                        checksum.short(),
                        record.describe()
                    );
                    tokio::time::sleep(self.settings.wait_poll_interval).await;
                }
                resolved => return Ok(resolved),
            }
        }
    }

    /// Commit a result, first writer wins.
    ///
    /// Captured output is copied into the entry and the returned entry's
    /// result points at those copies.
    pub async fn commit(
        &self,
        checksum: &Checksum,
        result: &ExecutionResult,
    ) -> CacheResult<CacheEntry> {
        if let Some(existing) = self.lookup(checksum)? {
            debug!("{} already committed; keeping first result", checksum.short());
            return Ok(existing);
        }

        let staging = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}-{}", checksum, Uuid::new_v4()));
        let outcome = self.commit_staged(checksum, result, &staging).await;
        if outcome.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        outcome
    }

    async fn commit_staged(
        &self,
        checksum: &Checksum,
        result: &ExecutionResult,
        staging: &Path,
    ) -> CacheResult<CacheEntry> {
        let entry_dir = self.entry_dir(checksum);
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| CacheError::io(staging, e))?;

        let mut stored = result.clone();
        stored.stdout_path = Some(entry_dir.join(STDOUT_FILE));
        stored.stderr_path = Some(entry_dir.join(STDERR_FILE));
        copy_capture(result.stdout_path.as_deref(), &staging.join(STDOUT_FILE)).await?;
        copy_capture(result.stderr_path.as_deref(), &staging.join(STDERR_FILE)).await?;

        let json = serde_json::to_vec_pretty(&stored)?;
        let result_path = staging.join(RESULT_FILE);
        tokio::fs::write(&result_path, json)
            .await
            .map_err(|e| CacheError::io(&result_path, e))?;

        let committed_at = Utc::now();
        write_marker(&staging.join(COMPLETE_MARKER), committed_at)?;

        for attempt in 0..2 {
            match tokio::fs::rename(staging, &entry_dir).await {
                Ok(()) => {
                    debug!("Committed {}", checksum.short());
                    return Ok(CacheEntry {
                        checksum: checksum.clone(),
                        dir: entry_dir,
                        committed_at,
                        result: stored,
                    });
                }
                Err(e) if entry_dir.exists() => {
                    if let Some(existing) = self.lookup(checksum)? {
                        let _ = tokio::fs::remove_dir_all(staging).await;
                        return Ok(existing);
                    }
                    if attempt > 0 {
                        return Err(CacheError::io(&entry_dir, e));
                    }
                    warn!(
                        "Removing incomplete cache entry {} before commit",
                        entry_dir.display()
                    );
                    tokio::fs::remove_dir_all(&entry_dir)
                        .await
                        .map_err(|e| CacheError::io(&entry_dir, e))?;
                }
                Err(e) => return Err(CacheError::io(&entry_dir, e)),
            }
        }

        Err(CacheError::lease(format!(
            "could not move {} into place",
            entry_dir.display()
        )))
    }

    /// Fresh isolated working directory for one execution of `checksum`
    pub async fn work_dir(&self, checksum: &Checksum) -> CacheResult<PathBuf> {
        let dir = self
            .root
            .join(WORK_DIR)
            .join(format!("{}-{}", checksum, Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        Ok(dir)
    }

    /// Remove a working directory once its outputs are committed
    pub async fn discard_work_dir(&self, dir: &Path) {
        if !dir.starts_with(self.root.join(WORK_DIR)) {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove work dir {}: {}", dir.display(), e);
            }
        }
    }
}

async fn copy_capture(source: Option<&Path>, dest: &Path) -> CacheResult<()> {
    match source {
        Some(source) => match tokio::fs::copy(source, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => tokio::fs::write(dest, b"")
                .await
                .map_err(|e| CacheError::io(dest, e)),
            Err(e) => Err(CacheError::io(source, e)),
        },
        None => tokio::fs::write(dest, b"")
            .await
            .map_err(|e| CacheError::io(dest, e)),
    }
}

fn write_marker(path: &Path, committed_at: DateTime<Utc>) -> CacheResult<()> {
    let mut file = std::fs::File::create(path).map_err(|e| CacheError::io(path, e))?;
    file.write_all(committed_at.to_rfc3339().as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| CacheError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Value;
    use indexmap::IndexMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample_result(checksum: &Checksum, work: &Path) -> ExecutionResult {
        std::fs::create_dir_all(work).unwrap();
        std::fs::write(work.join("stdout.txt"), "one\n").unwrap();
        std::fs::write(work.join("stderr.txt"), "").unwrap();

        let mut outputs = IndexMap::new();
        outputs.insert("return_code".to_string(), 0i64.into());
        outputs.insert("stdout".to_string(), "one".into());
        ExecutionResult {
            checksum: checksum.clone(),
            return_code: Some(0),
            outputs,
            stdout_path: Some(work.join("stdout.txt")),
            stderr_path: Some(work.join("stderr.txt")),
            errored: false,
            error: None,
            duration: Duration::from_millis(5),
        }
    }

    fn cache(temp: &TempDir) -> Cache {
        Cache::new(temp.path().join("cache"), CacheConfig::default())
    }

    #[tokio::test]
    async fn test_lookup_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(cache(&temp)
            .lookup(&Checksum::of_bytes(b"nothing"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_commit_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let checksum = Checksum::of_bytes(b"echo one");

        let Claim::Acquired(lease) = cache.claim(&checksum).await.unwrap() else {
            panic!("expected to acquire");
        };
        let work = cache.work_dir(&checksum).await.unwrap();
        let result = sample_result(&checksum, &work);

        let entry = cache.commit(&checksum, &result).await.unwrap();
        lease.release().await.unwrap();

        assert_eq!(entry.dir, cache.entry_dir(&checksum));
        let captured = entry.result.stdout_path.as_ref().unwrap();
        assert!(captured.starts_with(&entry.dir));
        assert_eq!(std::fs::read_to_string(captured).unwrap(), "one\n");

        let found = cache.lookup(&checksum).unwrap().unwrap();
        assert_eq!(found.result.outputs, result.outputs);
        assert!(matches!(
            cache.claim(&checksum).await.unwrap(),
            Claim::Cached(_)
        ));
    }

    #[tokio::test]
    async fn test_commit_is_first_writer_wins() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let checksum = Checksum::of_bytes(b"twice");
        let work = temp.path().join("w");

        let first = sample_result(&checksum, &work);
        let mut second = first.clone();
        second.outputs.insert("stdout".to_string(), "changed".into());

        let a = cache.commit(&checksum, &first).await.unwrap();
        let b = cache.commit(&checksum, &second).await.unwrap();

        assert_eq!(a.committed_at, b.committed_at);
        assert_eq!(b.result.outputs["stdout"], Value::from("one"));
    }

    #[tokio::test]
    async fn test_partial_entry_is_not_reported() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let checksum = Checksum::of_bytes(b"partial");

        let dir = cache.entry_dir(&checksum);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(RESULT_FILE), "{ truncated").unwrap();
        assert!(cache.lookup(&checksum).unwrap().is_none());

        let result = sample_result(&checksum, &temp.path().join("w"));
        let entry = cache.commit(&checksum, &result).await.unwrap();
        assert_eq!(entry.result.return_code, Some(0));
        assert!(cache.lookup(&checksum).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_busy_claim_then_wait_after_commit() {
        let temp = TempDir::new().unwrap();
        let settings = CacheConfig {
            wait_poll_interval: Duration::from_millis(20),
            ..CacheConfig::default()
        };
        let cache = Cache::new(temp.path().join("cache"), settings);
        let checksum = Checksum::of_bytes(b"shared");

        let Claim::Acquired(lease) = cache.claim(&checksum).await.unwrap() else {
            panic!("expected to acquire");
        };
        assert!(matches!(
            cache.claim(&checksum).await.unwrap(),
            Claim::Busy(_)
        ));

        let waiter = {
            let cache = cache.clone();
            let checksum = checksum.clone();
            tokio::spawn(async move { cache.wait_for(&checksum).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = sample_result(&checksum, &temp.path().join("w"));
        cache.commit(&checksum, &result).await.unwrap();
        lease.release().await.unwrap();

        let resolved = waiter.await.unwrap().unwrap();
        assert!(matches!(resolved, Claim::Cached(_)));
    }

    #[tokio::test]
    async fn test_wait_acquires_when_holder_releases_without_commit() {
        let temp = TempDir::new().unwrap();
        let settings = CacheConfig {
            wait_poll_interval: Duration::from_millis(20),
            ..CacheConfig::default()
        };
        let cache = Cache::new(temp.path().join("cache"), settings);
        let checksum = Checksum::of_bytes(b"abandoned");

        let Claim::Acquired(lease) = cache.claim(&checksum).await.unwrap() else {
            panic!("expected to acquire");
        };
        let waiter = {
            let cache = cache.clone();
            let checksum = checksum.clone();
            tokio::spawn(async move { cache.wait_for(&checksum).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lease.release().await.unwrap();

        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let temp = TempDir::new().unwrap();
        let settings = CacheConfig {
            wait_poll_interval: Duration::from_millis(10),
            claim_timeout: Some(Duration::from_millis(50)),
            ..CacheConfig::default()
        };
        let cache = Cache::new(temp.path().join("cache"), settings);
        let checksum = Checksum::of_bytes(b"slow");

        let _lease = cache.claim(&checksum).await.unwrap();
        let err = cache.wait_for(&checksum).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
    }
}
