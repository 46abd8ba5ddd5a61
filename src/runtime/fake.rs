//! In-memory runtime used by unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;

use super::{
    ContainerRuntime, ContainerSpec, ImageBuildRequest, RuntimeContainer, RuntimeError,
    RuntimeStatus,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub status: RuntimeStatus,
    pub public_ports: Vec<u16>,
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    images: Vec<String>,
    build_lines: Vec<String>,
    build_error: Option<String>,
    /// When set, a build reports success without tagging the image.
    drop_tag: bool,
    failing: HashSet<String>,
    fail_create: bool,
    builds: Vec<ImageBuildRequest>,
    created: Vec<ContainerSpec>,
    calls: Vec<String>,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("Poisoned mutex")
    }

    pub fn add_container(&self, id: &str, status: RuntimeStatus, public_ports: Vec<u16>) {
        self.state().containers.insert(
            id.to_string(),
            FakeContainer {
                status,
                public_ports,
            },
        );
    }

    /// Drop a container without going through the runtime API.
    pub fn remove_entry(&self, id: &str) {
        self.state().containers.remove(id);
    }

    pub fn set_build_lines(&self, lines: &[&str]) {
        self.state().build_lines = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn fail_build_with(&self, message: &str) {
        self.state().build_error = Some(message.to_string());
    }

    pub fn drop_built_tag(&self) {
        self.state().drop_tag = true;
    }

    pub fn clear_build_failures(&self) {
        let mut state = self.state();
        state.build_error = None;
        state.drop_tag = false;
    }

    pub fn fail_create(&self) {
        self.state().fail_create = true;
    }

    /// Every runtime call against `id` fails from now on.
    pub fn fail_calls_for(&self, id: &str) {
        self.state().failing.insert(id.to_string());
    }

    pub fn status_of(&self, id: &str) -> Option<RuntimeStatus> {
        self.state().containers.get(id).map(|c| c.status)
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state().created.clone()
    }

    pub fn builds(&self) -> Vec<ImageBuildRequest> {
        self.state().builds.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    fn with_container(
        &self,
        op: &str,
        id: &str,
        apply: impl FnOnce(&mut FakeContainer),
    ) -> Result<(), RuntimeError> {
        self.record(format!("{op} {id}"));
        let mut state = self.state();
        if state.failing.contains(id) {
            return Err(RuntimeError::Build(format!("{op} refused for {id}")));
        }
        match state.containers.get_mut(id) {
            Some(container) => {
                apply(container);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| all || c.status == RuntimeStatus::Running)
            .map(|(id, c)| RuntimeContainer {
                id: id.clone(),
                names: vec![format!("/{id}")],
                image: None,
                status: Some(c.status.to_string()),
                public_ports: c.public_ports.clone(),
            })
            .collect())
    }

    async fn list_image_tags(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.state().images.clone())
    }

    fn build_image(&self, request: ImageBuildRequest) -> BoxStream<'_, Result<String, RuntimeError>> {
        let mut state = self.state();
        let mut items: Vec<Result<String, RuntimeError>> =
            state.build_lines.iter().cloned().map(Ok).collect();
        match state.build_error.clone() {
            Some(message) => items.push(Err(RuntimeError::Build(message))),
            None if !state.drop_tag => state.images.push(request.tag.clone()),
            None => {}
        }
        state.builds.push(request);
        stream::iter(items).boxed()
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(RuntimeError::Build(format!(
                "name {} is already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                status: RuntimeStatus::Created,
                public_ports: vec![spec.host_port],
            },
        );
        state.created.push(spec);
        Ok(id)
    }

    async fn inspect_status(&self, id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let mut status = RuntimeStatus::Unknown;
        self.with_container("inspect", id, |c| status = c.status)?;
        Ok(status)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("start", id, |c| c.status = RuntimeStatus::Running)
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("stop", id, |c| c.status = RuntimeStatus::Exited)
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("restart", id, |c| c.status = RuntimeStatus::Running)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("remove", id, |_| {})?;
        self.state().containers.remove(id);
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("unpause", id, |c| c.status = RuntimeStatus::Running)
    }
}
