// Subcommands of the algobox binary
use algobox_common::{AlgorithmImage, ExecutorConfig, InputFile, JobContext, JobId, JobStatus};
use algobox_executor::{report, DockerRuntime, Executor, ExecutorError, Reaper};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

pub struct RunArgs {
    pub image: PathBuf,
    pub digest: String,
    pub inputs: Vec<PathBuf>,
    pub result: PathBuf,
    pub job_id: Option<Uuid>,
    pub pretty: bool,
}

/// Validate the command line into a job
fn job_context(args: &RunArgs) -> Result<JobContext> {
    if !args.image.is_file() {
        bail!("image archive {} does not exist", args.image.display());
    }
    if args.digest.trim().is_empty() {
        bail!("image digest must not be empty");
    }

    let mut inputs = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let file = InputFile::from_path(path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?;
        if file.entry_name().is_none() {
            bail!("input {} has no usable file name", path.display());
        }
        inputs.push(file);
    }

    Ok(JobContext {
        job_id: args.job_id.map(JobId::from).unwrap_or_default(),
        inputs,
        image: AlgorithmImage {
            archive: args.image.clone(),
            digest: args.digest.trim().to_string(),
        },
        result_path: args.result.clone(),
    })
}

fn connect(config: &ExecutorConfig) -> Result<Arc<DockerRuntime>> {
    let runtime = DockerRuntime::connect(config.docker_host.as_deref())
        .context("Failed to connect to the Docker daemon")?;
    Ok(Arc::new(runtime))
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn was_interrupted(outcome: &Result<Value, ExecutorError>) -> bool {
    match outcome {
        Err(ExecutorError::Interrupted) => true,
        Err(ExecutorError::Teardown { outcome, .. }) => was_interrupted(outcome),
        _ => false,
    }
}

pub async fn run_job(args: RunArgs) -> Result<ExitCode> {
    let config = ExecutorConfig::from_env();
    let job = job_context(&args)?;
    let job_id = job.job_id;
    let runtime = connect(&config)?;

    info!(job_id = %job_id, io_image = %config.io_image, "Submitting job");

    let executor = Executor::new(runtime, config, job);

    let outcome = executor.execute_until(shutdown_signal()).await;
    let interrupted = was_interrupted(&outcome);
    if interrupted {
        warn!(job_id = %job_id, "Job interrupted");
    }

    let report = report(job_id, &outcome);
    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    if interrupted {
        return Ok(ExitCode::from(130));
    }
    Ok(match report.status {
        JobStatus::Succeeded => ExitCode::SUCCESS,
        JobStatus::Failed => ExitCode::from(1),
        JobStatus::Errored => ExitCode::from(2),
    })
}

pub async fn reap_job(job_id: Uuid) -> Result<ExitCode> {
    let config = ExecutorConfig::from_env();
    let runtime = connect(&config)?;
    let job_id = JobId::from(job_id);

    Reaper::new(runtime, job_id, config.prune_retry)
        .reap()
        .await
        .with_context(|| format!("Failed to reap job {}", job_id))?;

    info!(job_id = %job_id, "Job resources removed");
    Ok(ExitCode::SUCCESS)
}
