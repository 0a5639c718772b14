//! Drives one task from claim to folded output.

use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cache::{Cache, CacheError, Checksum, Claim, Lease};
use crate::error::{Result, SplitflowError};
use crate::execution::{ExecutionResult, TaskOutput};
use crate::task::plan::DispatchPlan;

type Resolved = HashMap<Checksum, ExecutionResult>;

/// Claim every unique checksum, run what is ours, wait out what another
/// executor holds, then assemble results in split order.
pub(super) async fn drive(
    plan: DispatchPlan,
    cache: Cache,
    backend: Arc<dyn Backend>,
) -> Result<TaskOutput> {
    let mut resolved = Resolved::new();
    let mut acquired = HashMap::new();
    let mut busy = Vec::new();

    for checksum in plan.unique_checksums() {
        match cache.claim(checksum).await {
            Ok(Claim::Cached(entry)) => {
                resolved.insert(checksum.clone(), entry.into_result());
            }
            Ok(Claim::Acquired(lease)) => {
                acquired.insert(checksum.clone(), lease);
            }
            Ok(Claim::Busy(record)) => {
                debug!("{} is held by {}", checksum.short(), record.describe());
                busy.push(checksum.clone());
            }
            Err(e) => {
                resolved.insert(checksum.clone(), cache_failure(checksum, e));
            }
        }
    }

    info!(
        "{}: {} cached, {} to run, {} held elsewhere",
        plan.task_name,
        resolved.len(),
        acquired.len(),
        busy.len()
    );

    let (ran, waited) = tokio::join!(
        execute(&plan, &cache, backend.as_ref(), acquired),
        settle_busy(&plan, &cache, backend.as_ref(), busy),
    );
    resolved.extend(ran?);
    resolved.extend(waited?);

    let results: Vec<ExecutionResult> = plan
        .slots
        .iter()
        .map(|slot| {
            resolved.get(&slot.checksum).cloned().unwrap_or_else(|| {
                ExecutionResult::errored(slot.checksum.clone(), "no result was produced")
            })
        })
        .collect();

    let errored = results.iter().filter(|r| r.errored).count();
    if errored > 0 {
        warn!(
            "{}: {} of {} instance(s) errored",
            plan.task_name,
            errored,
            results.len()
        );
    } else {
        info!("{}: all {} instance(s) succeeded", plan.task_name, results.len());
    }

    plan.fold(results)
}

/// Wait for checksums held by other executors. Those whose holder went away
/// without committing are run here instead.
async fn settle_busy(
    plan: &DispatchPlan,
    cache: &Cache,
    backend: &dyn Backend,
    busy: Vec<Checksum>,
) -> Result<Resolved> {
    let mut resolved = Resolved::new();
    if busy.is_empty() {
        return Ok(resolved);
    }

    let waits = busy.into_iter().map(|checksum| async move {
        let claim = cache.wait_for(&checksum).await;
        (checksum, claim)
    });

    let mut reclaimed = HashMap::new();
    for (checksum, claim) in futures::future::join_all(waits).await {
        match claim {
            Ok(Claim::Cached(entry)) => {
                resolved.insert(checksum, entry.into_result());
            }
            Ok(Claim::Acquired(lease)) => {
                info!("Taking over {} from an abandoned lease", checksum.short());
                reclaimed.insert(checksum, lease);
            }
            Ok(Claim::Busy(record)) => {
                let description = format!("still held by {}", record.describe());
                resolved.insert(checksum.clone(), ExecutionResult::errored(checksum, description));
            }
            Err(e) => {
                let result = cache_failure(&checksum, e);
                resolved.insert(checksum, result);
            }
        }
    }

    resolved.extend(execute(plan, cache, backend, reclaimed).await?);
    Ok(resolved)
}

/// Run the checksums we hold leases for and commit their results
async fn execute(
    plan: &DispatchPlan,
    cache: &Cache,
    backend: &dyn Backend,
    leases: HashMap<Checksum, Lease>,
) -> Result<Resolved> {
    let mut resolved = Resolved::new();
    if leases.is_empty() {
        return Ok(resolved);
    }

    let mut held: HashMap<Checksum, (Lease, PathBuf)> = HashMap::new();
    let mut jobs = Vec::with_capacity(leases.len());
    for (checksum, lease) in leases {
        let work_dir = match cache.work_dir(&checksum).await {
            Ok(dir) => dir,
            Err(e) => {
                resolved.insert(checksum.clone(), cache_failure(&checksum, e));
                release(lease).await;
                continue;
            }
        };

        match plan.job(&checksum, work_dir.clone()) {
            Some(job) => {
                jobs.push(job);
                held.insert(checksum, (lease, work_dir));
            }
            None => {
                let result = ExecutionResult::errored(checksum.clone(), "checksum is not part of the plan");
                resolved.insert(checksum, result);
                release(lease).await;
            }
        }
    }

    let mut stream = backend.submit(jobs).await?;
    while let Some((checksum, result)) = stream.next().await {
        let Some((lease, work_dir)) = held.remove(&checksum) else {
            warn!("Ignoring unexpected result for {}", checksum.short());
            continue;
        };

        let result = if result.errored {
            // Left uncommitted so a later run retries it; the work dir keeps
            // the captured output for inspection
            debug!(
                "Not caching errored {}: {}",
                checksum.short(),
                result.error.as_deref().unwrap_or("unknown error")
            );
            result
        } else {
            match cache.commit(&checksum, &result).await {
                Ok(entry) => {
                    cache.discard_work_dir(&work_dir).await;
                    entry.into_result()
                }
                Err(e) => cache_failure(&checksum, e),
            }
        };

        release(lease).await;
        resolved.insert(checksum, result);
    }

    for (checksum, (lease, _)) in held {
        let result = ExecutionResult::errored(
            checksum.clone(),
            "backend finished without reporting a result",
        );
        resolved.insert(checksum, result);
        release(lease).await;
    }

    Ok(resolved)
}

async fn release(lease: Lease) {
    let checksum = lease.checksum().clone();
    if let Err(e) = lease.release().await {
        warn!("Failed to release lease for {}: {}", checksum.short(), e);
    }
}

fn cache_failure(checksum: &Checksum, error: CacheError) -> ExecutionResult {
    let error = SplitflowError::from(error);
    warn!("Cache failure for {}: {}", checksum.short(), error);
    ExecutionResult::errored(checksum.clone(), error.to_string())
}
