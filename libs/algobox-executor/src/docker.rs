//! Docker Runtime - `ContainerRuntime` over the Docker Engine API
//!
//! **Core Responsibility:**
//! Translate the runtime seam into bollard calls against one daemon.
//!
//! **Notes:**
//! - Containers started here are never auto-removed; the reaper prunes them
//!   by label once the job is over
//! - Volume prunes pass `all=true` so named volumes are included
//! - Requests may legitimately take as long as the algorithm runs, so the
//!   client timeout is set far above bollard's default

use crate::runtime::{
    ArchiveDownload, ContainerOutput, ContainerRuntime, ContainerSpec, LabelFilter, Mount,
    RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogOutput, LogsOptions, PruneContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ImportImageOptions, ListImagesOptions};
use bollard::models::HostConfig;
use bollard::volume::{CreateVolumeOptions, PruneVolumesOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Seconds allowed to establish the connection
const CONNECT_TIMEOUT_SECS: u64 = 120;
/// Per-request limit; `wait_container` blocks for the whole algorithm run
const REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Grace period before a stopped container is killed
const STOP_GRACE_SECS: i64 = 10;
/// Stderr kept from any container; older output is dropped first
const STDERR_TAIL_BYTES: usize = 64 * 1024;

impl From<DockerError> for RuntimeError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api {
                status: status_code,
                message,
            },
            DockerError::RequestTimeoutError => {
                RuntimeError::Transport("request timed out".to_string())
            }
            e @ (DockerError::IOError { .. } | DockerError::HyperResponseError { .. }) => {
                RuntimeError::Transport(e.to_string())
            }
            other => RuntimeError::Other(other.to_string()),
        }
    }
}

fn bind(mount: &Mount) -> String {
    let target = match mount.target.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!("{}:{}:{}", mount.volume, target, mode)
}

/// Container configuration for a spec
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let resources = spec.resources;
    let host_config = HostConfig {
        binds: Some(spec.mounts.iter().map(bind).collect()),
        memory: Some(resources.memory_bytes),
        cpu_quota: Some(resources.cpu_quota),
        cpu_period: Some(resources.cpu_period),
        network_mode: resources.network_disabled.then(|| "none".to_string()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.cmd.clone(),
        labels: Some(spec.labels.clone()),
        tty: Some(spec.tty),
        open_stdin: Some(spec.tty),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(resources.network_disabled),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// `image@sha256:...` → `sha256:...`
fn digest_of(repo_digest: &str) -> Option<&str> {
    repo_digest.split_once('@').map(|(_, digest)| digest)
}

/// Runtime backed by a Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `host` (`unix://`, `tcp://` or `http://`), or to the local
    /// defaults (`DOCKER_HOST` or the platform socket) when `None`.
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            Some(addr) if addr.starts_with("unix://") => {
                Docker::connect_with_unix(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(addr) => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };
        info!(host = host.unwrap_or("local defaults"), "Connected to Docker daemon");
        Ok(Self {
            docker: docker.with_timeout(REQUEST_TIMEOUT),
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config(spec))
            .await?;
        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container_id = %response.id, image = %spec.image, "Started container");
        Ok(response.id)
    }

    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        let mut exit_code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                // bollard reports non-zero exits as an error
                Err(DockerError::DockerContainerWaitError { code, .. }) => exit_code = code,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(exit_code)
    }

    async fn collect_logs(
        &self,
        container_id: &str,
        spec: &ContainerSpec,
    ) -> Result<(Vec<u8>, Vec<u8>), RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: spec.capture_stdout,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let logs = self.docker.logs(container_id, Some(options));
        drain_logs(logs, spec.capture_stdout, spec.output_limit).await
    }
}

fn keep_tail(buf: &mut Vec<u8>, limit: usize) {
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
    }
}

/// Split a log stream into stdout and stderr.
///
/// Stdout is dropped unless `capture_stdout`; past `stdout_limit` it is an
/// error. Only the last `STDERR_TAIL_BYTES` of stderr are kept.
async fn drain_logs<S>(
    logs: S,
    capture_stdout: bool,
    stdout_limit: Option<u64>,
) -> Result<(Vec<u8>, Vec<u8>), RuntimeError>
where
    S: Stream<Item = Result<LogOutput, DockerError>>,
{
    let mut logs = std::pin::pin!(logs);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(output) = logs.next().await {
        match output? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                if !capture_stdout {
                    continue;
                }
                stdout.extend_from_slice(&message);
                if let Some(limit) = stdout_limit {
                    if stdout.len() as u64 > limit {
                        return Err(RuntimeError::OutputTooLarge { limit });
                    }
                }
            }
            LogOutput::StdErr { message } => {
                stderr.extend_from_slice(&message);
                if stderr.len() > 2 * STDERR_TAIL_BYTES {
                    keep_tail(&mut stderr, STDERR_TAIL_BYTES);
                }
            }
            LogOutput::StdIn { .. } => {}
        }
    }
    keep_tail(&mut stderr, STDERR_TAIL_BYTES);
    Ok((stdout, stderr))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        debug!(image = %reference, "Pulled image");
        Ok(())
    }

    async fn image_ids(&self) -> Result<Vec<String>, RuntimeError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let mut ids = Vec::with_capacity(images.len());
        for image in images {
            ids.extend(image.repo_digests.iter().filter_map(|d| digest_of(d)).map(str::to_string));
            ids.push(image.id);
        }
        Ok(ids)
    }

    async fn load_image(&self, archive: Bytes) -> Result<(), RuntimeError> {
        let size = archive.len();
        let mut stream = self
            .docker
            .import_image(ImportImageOptions { quiet: true }, archive, None);
        while let Some(info) = stream.next().await {
            if let Some(message) = info?.error {
                return Err(RuntimeError::Other(format!("image load failed: {}", message)));
            }
        }
        debug!(bytes = size, "Loaded image archive");
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        // The engine hands back an existing volume of the same name instead
        // of failing
        match self.docker.inspect_volume(name).await {
            Ok(_) => {
                return Err(RuntimeError::Api {
                    status: 409,
                    message: format!("volume {} already exists", name),
                })
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn start_detached(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.create(spec).await
    }

    async fn run_to_completion(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerOutput, RuntimeError> {
        let container_id = self.create(spec).await?;
        let exit_code = self.wait(&container_id).await?;
        let (stdout, stderr) = self.collect_logs(&container_id, spec).await?;
        Ok(ContainerOutput {
            container_id,
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn put_archive(
        &self,
        container_id: &str,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), archive)
            .await?;
        Ok(())
    }

    async fn get_archive(
        &self,
        container_id: &str,
        path: &Path,
    ) -> Result<ArchiveDownload, RuntimeError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string_lossy().into_owned(),
        };
        let body = self
            .docker
            .download_from_container(container_id, Some(options))
            .map(|chunk| chunk.map_err(RuntimeError::from))
            .boxed();
        // bollard exposes no archive stat call; the tar header is checked instead
        Ok(ArchiveDownload {
            declared_size: None,
            body,
        })
    }

    async fn list_running(&self, filter: &LabelFilter) -> Result<Vec<String>, RuntimeError> {
        let options = ListContainersOptions {
            all: false,
            filters: filter.clone(),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(container_id, Some(options)).await {
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => Ok(other?),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn prune_containers(&self, filter: &LabelFilter) -> Result<(), RuntimeError> {
        let response = self
            .docker
            .prune_containers(Some(PruneContainersOptions {
                filters: filter.clone(),
            }))
            .await?;
        debug!(
            removed = response.containers_deleted.map_or(0, |c| c.len()),
            "Pruned containers"
        );
        Ok(())
    }

    async fn prune_volumes(&self, filter: &LabelFilter) -> Result<(), RuntimeError> {
        let mut filters = filter.clone();
        filters.insert("all".to_string(), vec!["true".to_string()]);
        let response = self
            .docker
            .prune_volumes(Some(PruneVolumesOptions { filters }))
            .await?;
        debug!(
            removed = response.volumes_deleted.map_or(0, |v| v.len()),
            "Pruned volumes"
        );
        Ok(())
    }
}
