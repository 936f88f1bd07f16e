use crate::reaper::PruneTarget;
use crate::runtime::RuntimeError;
use algobox_common::{FailureKind, JobId, JobReport};
use serde_json::Value;
use std::time::Duration;

/// Everything `Executor::execute` can fail with
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Image pull/load or volume creation failed; no container ran
    #[error("setup failed while {context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: RuntimeError,
    },

    #[error("staging inputs failed while {context}: {source}")]
    Stage {
        context: String,
        #[source]
        source: RuntimeError,
    },

    /// The algorithm exited non-zero
    #[error("algorithm exited with status {exit_code}: {stderr}")]
    Algorithm { exit_code: i64, stderr: String },

    #[error("algorithm exceeded its wall-clock limit of {}s", .limit.as_secs())]
    TimedOut { limit: Duration },

    /// The runtime failed underneath a running step
    #[error("container runtime failed while {context}: {source}")]
    Infrastructure {
        context: String,
        #[source]
        source: RuntimeError,
    },

    #[error("invalid result: {0}")]
    ResultFormat(String),

    /// Shutdown was requested before the job finished
    #[error("job interrupted before it finished")]
    Interrupted,

    /// Job resources could not be released. `outcome` is what the job
    /// produced before teardown ran.
    #[error("teardown failed: {target} prune gave up after {attempts} attempt(s): {source}")]
    Teardown {
        target: PruneTarget,
        attempts: u32,
        #[source]
        source: RuntimeError,
        outcome: Box<Result<Value, ExecutorError>>,
    },
}

impl ExecutorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutorError::Setup { .. } => FailureKind::Setup,
            ExecutorError::Stage { .. } => FailureKind::Stage,
            ExecutorError::Algorithm { .. } => FailureKind::Algorithm,
            ExecutorError::TimedOut { .. } => FailureKind::TimedOut,
            ExecutorError::Infrastructure { .. } => FailureKind::Infrastructure,
            ExecutorError::ResultFormat(_) => FailureKind::ResultFormat,
            ExecutorError::Interrupted => FailureKind::Infrastructure,
            ExecutorError::Teardown { .. } => FailureKind::Teardown,
        }
    }

    pub(crate) fn setup(context: impl Into<String>) -> impl FnOnce(RuntimeError) -> Self {
        let context = context.into();
        move |source| ExecutorError::Setup { context, source }
    }

    pub(crate) fn stage(context: impl Into<String>) -> impl FnOnce(RuntimeError) -> Self {
        let context = context.into();
        move |source| ExecutorError::Stage { context, source }
    }

    pub(crate) fn infrastructure(context: impl Into<String>) -> impl FnOnce(RuntimeError) -> Self {
        let context = context.into();
        move |source| ExecutorError::Infrastructure { context, source }
    }
}

/// Turn the outcome of `execute` into the report handed to callers
pub fn report(job_id: JobId, outcome: &Result<Value, ExecutorError>) -> JobReport {
    match outcome {
        Ok(value) => JobReport::succeeded(job_id, value.clone()),
        Err(err @ ExecutorError::Teardown { outcome, .. }) => {
            let mut report = JobReport::failed(job_id, err.kind(), err.to_string());
            match outcome.as_ref() {
                Ok(value) => report.result = Some(value.clone()),
                Err(job_err) => {
                    report.detail = Some(format!("{}; job outcome: {}", err, job_err));
                }
            }
            report
        }
        Err(err) => JobReport::failed(job_id, err.kind(), err.to_string()),
    }
}
