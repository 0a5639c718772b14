//! Common test utilities and helpers

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use splitflow::config::RetryPolicy;
use splitflow::subprocess::MockProcessRunner;
use splitflow::{EngineConfig, Submitter, Task};

/// Engine config with short waits so tests stay fast
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.local.workers = 4;
    config.cache.wait_poll_interval = Duration::from_millis(20);
    config.batch.poll_interval = Duration::from_millis(10);
    config.batch.retry = fast_retry(2);
    config.cluster.retry = fast_retry(2);
    config
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// `echo` split over `words`, caching under `cache_dir`
pub fn echo_task(cache_dir: &Path, words: &[&str]) -> Task {
    Task::builder("echo", "echo")
        .input("args", words.to_vec())
        .split("args")
        .cache_dir(cache_dir)
        .build()
        .expect("valid echo task")
}

/// Open a submitter whose processes are answered by `mock`
pub async fn mock_submitter(mock: &MockProcessRunner, config: EngineConfig) -> Submitter {
    Submitter::builder(config)
        .runner(Arc::new(mock.clone()))
        .open()
        .await
        .expect("submitter opens")
}

/// Captured stdout of every result, in output order
pub fn stdouts(output: &splitflow::TaskOutput) -> Vec<String> {
    output
        .values()
        .iter()
        .map(|r| r.stdout().unwrap_or_default().to_string())
        .collect()
}
