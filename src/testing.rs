//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::Config;
use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::netns::{CommandOutput, CommandRunner};
use crate::runtime::{BuildRequest, ContainerInfo, ContainerRuntime, ContainerSpec, ProgressRecord, ProgressSink};

pub fn test_context(runtime: RecordingRuntime, runner: ScriptedRunner) -> AgentContext {
    test_context_with(runtime, runner, |_| {})
}

pub fn test_context_with(
    runtime: RecordingRuntime,
    runner: ScriptedRunner,
    configure: impl FnOnce(&mut Config),
) -> AgentContext {
    let mut config = Config {
        retry_delay_secs: 0,
        ..Config::default()
    };
    configure(&mut config);
    AgentContext::new(config, Arc::new(runtime), Arc::new(runner))
}

fn injected(message: &str) -> Error {
    Error::Docker(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: message.to_string(),
    })
}

#[derive(Debug, Clone, Default)]
struct FakeContainer {
    id: String,
    pid: Option<i64>,
    running: bool,
    ports: BTreeMap<String, Vec<String>>,
    logs: String,
}

#[derive(Debug, Default)]
struct RuntimeState {
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeSet<String>,
    images: BTreeSet<String>,
    gateway: Option<String>,
    pull_records: Vec<ProgressRecord>,
    build_records: Vec<ProgressRecord>,
    exec_code: i64,
    fail_removal: HashSet<String>,
    fail_start: HashSet<String>,
    fail_logs: HashSet<String>,

    pulls: Vec<String>,
    builds: Vec<BuildRequest>,
    created: Vec<ContainerSpec>,
    started: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    removed_images: Vec<String>,
    connects: Vec<(String, String, Vec<String>)>,
    log_requests: Vec<(String, usize)>,
    execs: Vec<(String, Vec<String>, String)>,
    cpu_updates: Vec<(String, i64)>,
}

/// Container runtime that keeps containers and networks in memory and
/// records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl RecordingRuntime {
    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    /// Adds a stopped container with id `id-<name>`.
    pub fn add_container(&self, name: &str, pid: Option<i64>) {
        self.state().containers.insert(
            name.to_string(),
            FakeContainer {
                id: format!("id-{}", name),
                pid,
                ..Default::default()
            },
        );
    }

    pub fn set_ports(&self, name: &str, ports: &[(&str, &str)]) {
        let mut state = self.state();
        let container = state.containers.entry(name.to_string()).or_default();
        for (key, host) in ports {
            container
                .ports
                .entry(key.to_string())
                .or_default()
                .push(host.to_string());
        }
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        if let Some(container) = self.state().containers.get_mut(name) {
            container.logs = logs.to_string();
        }
    }

    pub fn set_gateway(&self, gateway: Option<&str>) {
        self.state().gateway = gateway.map(String::from);
    }

    pub fn set_exec_code(&self, code: i64) {
        self.state().exec_code = code;
    }

    pub fn set_pull_records(&self, records: Vec<ProgressRecord>) {
        self.state().pull_records = records;
    }

    pub fn set_build_records(&self, records: Vec<ProgressRecord>) {
        self.state().build_records = records;
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    pub fn fail_removal_of(&self, name: &str) {
        self.state().fail_removal.insert(name.to_string());
    }

    pub fn fail_start_of(&self, name: &str) {
        self.state().fail_start.insert(name.to_string());
    }

    /// Log reads for `name` fail as with a log driver that cannot be read.
    pub fn fail_logs_of(&self, name: &str) {
        self.state().fail_logs.insert(name.to_string());
    }

    pub fn containers(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state().networks.iter().cloned().collect()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.state().builds.clone()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn connects(&self) -> Vec<(String, String, Vec<String>)> {
        self.state().connects.clone()
    }

    pub fn log_requests(&self) -> Vec<(String, usize)> {
        self.state().log_requests.clone()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>, String)> {
        self.state().execs.clone()
    }

    pub fn cpu_updates(&self) -> Vec<(String, i64)> {
        self.state().cpu_updates.clone()
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn pull_image(&self, image: &str, sink: ProgressSink<'_>) -> Result<()> {
        let records = {
            let mut state = self.state();
            state.pulls.push(image.to_string());
            state.images.insert(image.to_string());
            state.pull_records.clone()
        };
        for record in records {
            sink(record);
        }
        Ok(())
    }

    async fn build_image(&self, request: BuildRequest, sink: ProgressSink<'_>) -> Result<()> {
        let records = {
            let mut state = self.state();
            state.images.insert(request.tag.clone());
            state.builds.push(request);
            state.build_records.clone()
        };
        for record in records {
            sink(record);
        }
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<()> {
        if self.state().images.contains(image) {
            Ok(())
        } else {
            Err(Error::ImageNotFound(image.to_string()))
        }
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let mut state = self.state();
        if !state.images.remove(image) {
            return Err(Error::ImageNotFound(image.to_string()));
        }
        state.removed_images.push(image.to_string());
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.state().networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        if self.state().networks.remove(name) {
            Ok(())
        } else {
            Err(Error::NetworkNotFound(name.to_string()))
        }
    }

    async fn connect_network(&self, network: &str, container: &str, aliases: Vec<String>) -> Result<()> {
        let mut state = self.state();
        if !state.networks.contains(network) {
            return Err(Error::NetworkNotFound(network.to_string()));
        }
        state
            .connects
            .push((network.to_string(), container.to_string(), aliases));
        Ok(())
    }

    async fn network_gateway(&self, _network: &str) -> Result<Option<String>> {
        Ok(self.state().gateway.clone())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        let id = format!("id-{}", spec.name);
        let pid = 1000 + state.created.len() as i64;
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                pid: Some(pid),
                ..Default::default()
            },
        );
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_start.contains(name) {
            return Err(injected("start failed"));
        }
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        container.running = true;
        state.started.push(name.to_string());
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        container.running = false;
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_removal.contains(name) {
            return Err(injected("removal failed"));
        }
        if state.containers.remove(name).is_none() {
            return Err(Error::ContainerNotFound(name.to_string()));
        }
        state.removed.push(name.to_string());
        Ok(())
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String> {
        let mut state = self.state();
        if state.fail_logs.contains(name) {
            return Err(Error::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 501,
                message: "configured logging driver does not support reading".to_string(),
            }));
        }
        let logs = state
            .containers
            .get(name)
            .map(|container| container.logs.clone())
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        state.log_requests.push((name.to_string(), tail));
        Ok(logs)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        self.state()
            .containers
            .get(name)
            .map(|container| ContainerInfo {
                id: container.id.clone(),
                pid: container.pid,
                running: container.running,
                ports: container.ports.clone(),
            })
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))
    }

    async fn exec(&self, name: &str, command: &[String], user: &str) -> Result<i64> {
        let mut state = self.state();
        state
            .execs
            .push((name.to_string(), command.to_vec(), user.to_string()));
        Ok(state.exec_code)
    }

    async fn update_cpu_shares(&self, name: &str, shares: i64) -> Result<()> {
        let mut state = self.state();
        if !state.containers.contains_key(name) {
            return Err(Error::ContainerNotFound(name.to_string()));
        }
        state.cpu_updates.push((name.to_string(), shares));
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.containers())
    }
}

/// Command runner that replays scripted outcomes and records argv.
/// Unscripted calls exit 0.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    // `None` is a launch failure.
    script: Arc<Mutex<VecDeque<Option<i32>>>>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedRunner {
    pub fn push_exit(&self, code: i32) {
        self.script.lock().unwrap().push_back(Some(code));
    }

    pub fn push_launch_error(&self) {
        self.script.lock().unwrap().push_back(None);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &[String], _env: &HashMap<String, String>) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_vec());
        match self.script.lock().unwrap().pop_front() {
            Some(None) => Err(io::Error::new(io::ErrorKind::NotFound, "no such program")),
            Some(Some(code)) => Ok(CommandOutput {
                code,
                ..Default::default()
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}
