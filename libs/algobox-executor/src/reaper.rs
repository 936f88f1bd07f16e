//! Reaper - label-keyed teardown of everything a job created
//!
//! Stops whatever still runs under the job label, then prunes stopped
//! containers and unused volumes carrying it. The engine allows one prune at
//! a time per host, so concurrent jobs collide; prunes are retried with
//! exponential backoff and jitter.

use crate::runtime::{ContainerRuntime, LabelFilter, RuntimeError};
use algobox_common::labels;
use algobox_common::{JobId, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Teardown could not release the job's resources
#[derive(Debug, thiserror::Error)]
#[error("{target} prune failed after {attempts} attempt(s): {source}")]
pub struct TeardownError {
    pub target: PruneTarget,
    pub attempts: u32,
    #[source]
    pub source: RuntimeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTarget {
    Containers,
    Volumes,
}

impl std::fmt::Display for PruneTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PruneTarget::Containers => write!(f, "container"),
            PruneTarget::Volumes => write!(f, "volume"),
        }
    }
}

/// Delay before the attempt following attempt number `attempt` (1-based)
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter_ms = policy.max_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(fastrand::u64(0..=jitter_ms))
    };
    policy.base_delay.saturating_mul(factor) + jitter
}

#[derive(Clone)]
pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    job_id: JobId,
    retry: RetryPolicy,
}

impl Reaper {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, job_id: JobId, retry: RetryPolicy) -> Self {
        Self {
            runtime,
            job_id,
            retry,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Release every container and volume labeled for the job.
    ///
    /// Volume pruning is attempted even when container pruning gave up; the
    /// first failure is returned.
    pub async fn reap(&self) -> Result<(), TeardownError> {
        let filter = labels::label_filter(&self.job_id);
        self.stop_running(&filter).await;

        let containers = self.prune(PruneTarget::Containers, &filter).await;
        let volumes = self.prune(PruneTarget::Volumes, &filter).await;

        match (containers, volumes) {
            (Ok(()), Ok(())) => {
                info!(job_id = %self.job_id, "Released job resources");
                Ok(())
            }
            (Err(e), other) => {
                if let Err(volume_err) = other {
                    error!(job_id = %self.job_id, error = %volume_err, "Volume prune failed");
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
        }
    }

    /// The algorithm and staging containers should have exited by now, but
    /// a crash mid-job can leave one running.
    async fn stop_running(&self, filter: &LabelFilter) {
        let running = match self.runtime.list_running(filter).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Failed to list running containers");
                return;
            }
        };
        for container_id in running {
            debug!(job_id = %self.job_id, container_id = %container_id, "Stopping container");
            if let Err(e) = self.runtime.stop_container(&container_id).await {
                warn!(
                    job_id = %self.job_id,
                    container_id = %container_id,
                    error = %e,
                    "Failed to stop container"
                );
            }
        }
    }

    async fn prune(&self, target: PruneTarget, filter: &LabelFilter) -> Result<(), TeardownError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match target {
                PruneTarget::Containers => self.runtime.prune_containers(filter).await,
                PruneTarget::Volumes => self.runtime.prune_volumes(filter).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = backoff_delay(&self.retry, attempt);
                    warn!(
                        job_id = %self.job_id,
                        target = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Prune failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    error!(
                        job_id = %self.job_id,
                        target = %target,
                        attempts = attempt,
                        error = %source,
                        "Prune failed, giving up"
                    );
                    return Err(TeardownError {
                        target,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
