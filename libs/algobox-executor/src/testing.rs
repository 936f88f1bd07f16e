//! In-memory container runtime for tests.
//!
//! Tracks labeled containers and volumes so tests can assert that nothing of a
//! job survives teardown, records every call in order, and lets tests script
//! run outputs, downloads and failures.

use crate::runtime::{
    ArchiveDownload, ContainerOutput, ContainerRuntime, ContainerSpec, LabelFilter, RuntimeError,
};
use algobox_common::labels;
use algobox_common::JobId;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Pull(String),
    ImageIds,
    Load(usize),
    CreateVolume(String),
    StartDetached(ContainerSpec),
    Run(ContainerSpec),
    PutArchive {
        container_id: String,
        dest_dir: String,
        archive: Vec<u8>,
    },
    GetArchive(String, PathBuf),
    ListRunning,
    Stop(String),
    Remove(String),
    PruneContainers,
    PruneVolumes,
}

/// Scripted result of one `run_to_completion` call
pub enum RunScript {
    Exit {
        code: i64,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    Fail(RuntimeError),
    /// Never finishes; the container stays running
    Hang,
}

impl RunScript {
    pub fn ok(stdout: &str) -> Self {
        RunScript::Exit {
            code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn exit(code: i64, stderr: &str) -> Self {
        RunScript::Exit {
            code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}

struct FakeContainer {
    labels: HashMap<String, String>,
    running: bool,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    images: HashSet<String>,
    loads_as: Option<String>,
    volumes: HashMap<String, HashMap<String, String>>,
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    runs: VecDeque<RunScript>,
    downloads: VecDeque<ArchiveDownload>,
    fail_pull: Option<RuntimeError>,
    fail_volume: Option<RuntimeError>,
    fail_put_archive: HashMap<usize, RuntimeError>,
    fail_remove: Option<RuntimeError>,
    container_prune_failures: VecDeque<RuntimeError>,
    volume_prune_failures: VecDeque<RuntimeError>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

fn conflict() -> RuntimeError {
    RuntimeError::Api {
        status: 409,
        message: "a prune operation is already running".to_string(),
    }
}

fn matches(filter: &LabelFilter, labels: &HashMap<String, String>) -> bool {
    filter.get("label").map_or(true, |wanted| {
        wanted.iter().all(|pair| match pair.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(pair.as_str()),
        })
    })
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// An image the runtime already knows
    pub fn with_image(self, digest: &str) -> Self {
        self.state().images.insert(digest.to_string());
        self
    }

    /// Loading any archive registers this digest
    pub fn loads_as(self, digest: &str) -> Self {
        self.state().loads_as = Some(digest.to_string());
        self
    }

    pub fn push_run(&self, script: RunScript) {
        self.state().runs.push_back(script);
    }

    pub fn push_download(&self, download: ArchiveDownload) {
        self.state().downloads.push_back(download);
    }

    pub fn fail_pull(&self, err: RuntimeError) {
        self.state().fail_pull = Some(err);
    }

    pub fn fail_volume_creation(&self, err: RuntimeError) {
        self.state().fail_volume = Some(err);
    }

    /// Fail the `index`-th upload (0-based)
    pub fn fail_put_archive(&self, index: usize, err: RuntimeError) {
        self.state().fail_put_archive.insert(index, err);
    }

    pub fn fail_remove(&self, err: RuntimeError) {
        self.state().fail_remove = Some(err);
    }

    /// Make the next `times` container prunes fail with a conflict
    pub fn fail_container_prunes(&self, times: usize) {
        let mut state = self.state();
        for _ in 0..times {
            state.container_prune_failures.push_back(conflict());
        }
    }

    pub fn fail_volume_prunes(&self, times: usize) {
        let mut state = self.state();
        for _ in 0..times {
            state.volume_prune_failures.push_back(conflict());
        }
    }

    pub fn push_container_prune_failure(&self, err: RuntimeError) {
        self.state().container_prune_failures.push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    /// (containers, volumes) still present for a job
    pub fn leftovers(&self, job_id: &JobId) -> (usize, usize) {
        let filter = labels::label_filter(job_id);
        let state = self.state();
        let containers = state
            .containers
            .values()
            .filter(|c| matches(&filter, &c.labels))
            .count();
        let volumes = state
            .volumes
            .values()
            .filter(|l| matches(&filter, l))
            .count();
        (containers, volumes)
    }

    pub fn running_count(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }

    fn add_container(state: &mut State, spec: &ContainerSpec, running: bool) -> String {
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                running,
            },
        );
        id
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Pull(reference.to_string()));
        if let Some(err) = state.fail_pull.take() {
            return Err(err);
        }
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn image_ids(&self) -> Result<Vec<String>, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::ImageIds);
        Ok(state.images.iter().cloned().collect())
    }

    async fn load_image(&self, archive: Bytes) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Load(archive.len()));
        if let Some(digest) = state.loads_as.clone() {
            state.images.insert(digest);
        }
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::CreateVolume(name.to_string()));
        if let Some(err) = state.fail_volume.take() {
            return Err(err);
        }
        if state.volumes.contains_key(name) {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("volume {} already exists", name),
            });
        }
        state.volumes.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn start_detached(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::StartDetached(spec.clone()));
        Ok(Self::add_container(&mut state, spec, true))
    }

    async fn run_to_completion(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerOutput, RuntimeError> {
        let (script, container_id) = {
            let mut state = self.state();
            state.calls.push(Call::Run(spec.clone()));
            let script = state.runs.pop_front().unwrap_or_else(|| RunScript::ok("{}"));
            let running = matches!(script, RunScript::Hang);
            let id = Self::add_container(&mut state, spec, running);
            (script, id)
        };

        match script {
            RunScript::Exit {
                code,
                stdout,
                stderr,
            } => {
                let stdout = if spec.capture_stdout { stdout } else { Vec::new() };
                if let Some(limit) = spec.output_limit {
                    if stdout.len() as u64 > limit {
                        return Err(RuntimeError::OutputTooLarge { limit });
                    }
                }
                Ok(ContainerOutput {
                    container_id,
                    exit_code: code,
                    stdout,
                    stderr,
                })
            }
            RunScript::Fail(err) => Err(err),
            RunScript::Hang => std::future::pending().await,
        }
    }

    async fn put_archive(
        &self,
        container_id: &str,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let index = state
            .calls
            .iter()
            .filter(|c| matches!(c, Call::PutArchive { .. }))
            .count();
        state.calls.push(Call::PutArchive {
            container_id: container_id.to_string(),
            dest_dir: dest_dir.to_string(),
            archive: archive.to_vec(),
        });
        match state.fail_put_archive.remove(&index) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn get_archive(
        &self,
        container_id: &str,
        path: &Path,
    ) -> Result<ArchiveDownload, RuntimeError> {
        let mut state = self.state();
        state
            .calls
            .push(Call::GetArchive(container_id.to_string(), path.to_path_buf()));
        Ok(state.downloads.pop_front().unwrap_or_else(|| ArchiveDownload {
            declared_size: None,
            body: stream::empty().boxed(),
        }))
    }

    async fn list_running(&self, filter: &LabelFilter) -> Result<Vec<String>, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::ListRunning);
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.running && matches(filter, &c.labels))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Stop(container_id.to_string()));
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Remove(container_id.to_string()));
        if let Some(err) = state.fail_remove.take() {
            return Err(err);
        }
        state.containers.remove(container_id);
        Ok(())
    }

    async fn prune_containers(&self, filter: &LabelFilter) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::PruneContainers);
        if let Some(err) = state.container_prune_failures.pop_front() {
            return Err(err);
        }
        state
            .containers
            .retain(|_, c| c.running || !matches(filter, &c.labels));
        Ok(())
    }

    async fn prune_volumes(&self, filter: &LabelFilter) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::PruneVolumes);
        if let Some(err) = state.volume_prune_failures.pop_front() {
            return Err(err);
        }
        state.volumes.retain(|_, l| !matches(filter, l));
        Ok(())
    }
}
