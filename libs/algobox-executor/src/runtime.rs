//! Container Runtime - Abstraction over the Container Engine
//!
//! **Core Responsibility:**
//! Expose the handful of engine operations a job needs: images, volumes,
//! containers and single-file archives.
//!
//! **Critical Architectural Boundary:**
//! - The runtime knows HOW to talk to the engine (Docker API, fake, ...)
//! - The runtime does NOT know the job pipeline or its failure taxonomy
//! - Every error comes back as a `RuntimeError`; callers decide what it means
//!
//! The executor receives the runtime as an injected `Arc<dyn ContainerRuntime>`,
//! so one daemon connection can be shared by many concurrent jobs.

use algobox_common::labels;
use algobox_common::{JobId, ResourceEnvelope};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::path::Path;

/// Label filter as understood by the engine's list/prune endpoints
pub type LabelFilter = HashMap<String, Vec<String>>;

/// Errors reported by a container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The engine answered with an error status
    #[error("container engine returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The engine could not be reached or the request did not complete
    #[error("container engine unreachable: {0}")]
    Transport(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("container output exceeded {limit} bytes")]
    OutputTooLarge { limit: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether repeating the same call may succeed.
    ///
    /// Engine API errors cover the "prune already running" conflict; transport
    /// errors cover a daemon that is briefly unavailable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Api { .. } | RuntimeError::Transport(_))
    }
}

/// A volume bound into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub volume: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one container of a job
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub mounts: Vec<Mount>,
    pub labels: HashMap<String, String>,
    pub resources: ResourceEnvelope,
    pub tty: bool,
    /// Whether stdout is collected at all
    pub capture_stdout: bool,
    /// Upper bound on captured stdout, in bytes
    pub output_limit: Option<u64>,
}

impl ContainerSpec {
    /// Spec for a container owned by `job_id`: job label and resource envelope applied
    pub fn for_job(image: impl Into<String>, job_id: &JobId, resources: ResourceEnvelope) -> Self {
        Self {
            image: image.into(),
            cmd: None,
            mounts: Vec::new(),
            labels: labels::job_labels(job_id),
            resources,
            tty: false,
            capture_stdout: true,
            output_limit: None,
        }
    }

    pub fn mount(mut self, volume: &str, target: &str, read_only: bool) -> Self {
        self.mounts.push(Mount {
            volume: volume.to_string(),
            target: target.to_string(),
            read_only,
        });
        self
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn tty(mut self) -> Self {
        self.tty = true;
        self
    }

    /// Leave stdout uncollected; only the stderr tail comes back
    pub fn discard_stdout(mut self) -> Self {
        self.capture_stdout = false;
        self
    }

    pub fn output_limit(mut self, limit: u64) -> Self {
        self.output_limit = Some(limit);
        self
    }
}

/// Outcome of a container that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOutput {
    pub container_id: String,
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A file downloaded from a container as a tar stream
pub struct ArchiveDownload {
    /// Size of the file as reported by the engine before any body is read
    pub declared_size: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, RuntimeError>>,
}

/// Container runtime trait
///
/// Implementations must:
/// 1. Attach `spec.labels` to every container they create
/// 2. Apply `spec.resources` (memory, CPU quota/period, networking)
/// 3. Leave containers created by `run_to_completion` in place once they
///    exit; they are pruned by label at teardown
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image by registry reference
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Ids (content digests) of every image known locally
    async fn image_ids(&self) -> Result<Vec<String>, RuntimeError>;

    /// Load an image from a saved image archive
    async fn load_image(&self, archive: Bytes) -> Result<(), RuntimeError>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    /// Create and start a container without waiting for it; returns its id
    async fn start_detached(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Create, start and wait for a container; returns its exit status and logs
    async fn run_to_completion(&self, spec: &ContainerSpec)
        -> Result<ContainerOutput, RuntimeError>;

    /// Upload a tar archive and unpack it at `dest_dir` inside the container
    async fn put_archive(
        &self,
        container_id: &str,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError>;

    /// Download `path` from the container as a tar stream
    async fn get_archive(
        &self,
        container_id: &str,
        path: &Path,
    ) -> Result<ArchiveDownload, RuntimeError>;

    /// Ids of running containers matching the filter
    async fn list_running(&self, filter: &LabelFilter) -> Result<Vec<String>, RuntimeError>;

    /// Stop a container; stopping an already stopped container is not an error
    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Delete every stopped container matching the filter
    async fn prune_containers(&self, filter: &LabelFilter) -> Result<(), RuntimeError>;

    /// Delete every unused volume matching the filter
    async fn prune_volumes(&self, filter: &LabelFilter) -> Result<(), RuntimeError>;
}
