//! Executor - One Container Job, Start to Finish
//!
//! **Pipeline (strictly sequential):**
//! 1. Make the helper and algorithm images available
//! 2. Create the labeled input/output volumes
//! 3. Stage the input files into the input volume
//! 4. Run the algorithm container
//! 5. Read and decode the result file from the output volume
//! 6. Reap everything carrying the job label
//!
//! **Cleanup guarantee:**
//! Step 6 runs on every exit path. When `execute` returns, teardown has been
//! awaited. When its future is dropped first, the teardown guard hands the
//! reap to the current tokio runtime. Callers that need to stop a job early
//! use `execute_until`, which abandons the remaining steps and still awaits
//! the reap in the foreground.

use crate::error::ExecutorError;
use crate::reaper::{Reaper, TeardownError};
use crate::runtime::ContainerRuntime;
use crate::{extract, images, runner, staging, volumes};
use algobox_common::{ExecutorConfig, JobContext, JobId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

/// Reaps the job when dropped unless `release` already did
struct TeardownGuard {
    reaper: Option<Reaper>,
}

impl TeardownGuard {
    fn arm(reaper: Reaper) -> Self {
        Self {
            reaper: Some(reaper),
        }
    }

    async fn release(mut self) -> Result<(), TeardownError> {
        let result = match &self.reaper {
            Some(reaper) => reaper.reap().await,
            None => Ok(()),
        };
        // Only disarm once the reap has finished; if this future is dropped
        // mid-reap, Drop starts it again.
        self.reaper = None;
        result
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(reaper) = self.reaper.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                warn!(job_id = %reaper.job_id(), "Job abandoned, reaping in background");
                handle.spawn(async move {
                    if let Err(e) = reaper.reap().await {
                        error!(job_id = %reaper.job_id(), error = %e, "Background teardown failed");
                    }
                });
            }
            Err(_) => {
                error!(
                    job_id = %reaper.job_id(),
                    "Job abandoned outside a tokio runtime; its containers and volumes were not reaped"
                );
            }
        }
    }
}

/// Runs exactly one job. Consumed by `execute`.
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    config: ExecutorConfig,
    job: JobContext,
}

impl Executor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ExecutorConfig, job: JobContext) -> Self {
        Self {
            runtime,
            config,
            job,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }

    /// Run the job and release its resources.
    ///
    /// A teardown failure replaces the job outcome; the outcome is kept inside
    /// `ExecutorError::Teardown`.
    pub async fn execute(self) -> Result<Value, ExecutorError> {
        self.execute_until(std::future::pending()).await
    }

    /// Like `execute`, but abandons the running step as soon as `shutdown`
    /// resolves and reports `ExecutorError::Interrupted`. Teardown runs once,
    /// before this returns.
    pub async fn execute_until<F>(self, shutdown: F) -> Result<Value, ExecutorError>
    where
        F: Future<Output = ()>,
    {
        let job_id = self.job.job_id;
        let start_time = Instant::now();
        info!(
            job_id = %job_id,
            image = %self.job.image.digest,
            inputs = self.job.inputs.len(),
            "Starting job"
        );

        let guard = TeardownGuard::arm(Reaper::new(
            self.runtime.clone(),
            job_id,
            self.config.prune_retry,
        ));

        let outcome = tokio::select! {
            outcome = self.run_steps() => outcome,
            () = shutdown => {
                warn!(job_id = %job_id, "Shutdown requested, abandoning job");
                Err(ExecutorError::Interrupted)
            }
        };

        match &outcome {
            Ok(_) => info!(job_id = %job_id, "Job produced a result"),
            Err(e) => warn!(job_id = %job_id, kind = ?e.kind(), error = %e, "Job failed"),
        }

        let result = match guard.release().await {
            Ok(()) => outcome,
            Err(teardown) => Err(ExecutorError::Teardown {
                target: teardown.target,
                attempts: teardown.attempts,
                source: teardown.source,
                outcome: Box::new(outcome),
            }),
        };

        info!(
            job_id = %job_id,
            total_time_ms = start_time.elapsed().as_millis() as u64,
            "Job finished"
        );
        result
    }

    async fn run_steps(&self) -> Result<Value, ExecutorError> {
        let runtime = self.runtime.as_ref();
        let job = &self.job;
        let config = &self.config;

        images::ensure_images(runtime, &config.io_image, &job.image).await?;

        let (input_volume, output_volume) = volumes::create_volumes(runtime, &job.job_id).await?;

        staging::stage_inputs(
            runtime,
            &config.io_image,
            &job.job_id,
            config.resources,
            &input_volume,
            &job.inputs,
        )
        .await?;

        runner::run_algorithm(
            runtime,
            &job.image.digest,
            &job.job_id,
            config.resources,
            &input_volume,
            &output_volume,
            config.run_timeout,
        )
        .await?;

        extract::extract_result(
            runtime,
            &config.io_image,
            &job.job_id,
            config.resources,
            &output_volume,
            &job.result_path,
        )
        .await
    }
}
