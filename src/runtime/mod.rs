use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::update::PortBindings;

pub mod docker;
pub use docker::DockerRuntime;

/// Receives each record of a pull or build stream as it arrives.
pub type ProgressSink<'a> = &'a mut (dyn FnMut(ProgressRecord) + Send);

/// One record of a pull or build progress stream, reduced to the fields the
/// image manager looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressRecord {
    pub status: Option<String>,
    pub id: Option<String>,
    pub stream: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
    /// Set when the record carries a non-empty `progressDetail`.
    pub has_progress_detail: bool,
    /// Set when the record carries an `errorDetail`.
    pub error_detail: Option<String>,
}

impl ProgressRecord {
    pub fn status(status: &str, id: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    /// The record's plain string fields, in stream order.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        [&self.stream, &self.status, &self.id, &self.progress, &self.error]
            .into_iter()
            .filter_map(|field| field.as_deref())
    }
}

/// Build context handed to the runtime: a tar archive with a Dockerfile.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    pub context: Vec<u8>,
    /// Pull newer base images before building.
    pub pull: bool,
}

/// Host-side container settings derived on every start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostConfig {
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub dns_search: Vec<String>,
    pub extra_hosts: BTreeMap<String, String>,
    pub network_mode: String,
    pub port_bindings: PortBindings,
    pub privileged: bool,
    pub publish_all_ports: bool,
    /// Restart policy name; always `no` so the daemon orders restarts.
    pub restart_policy: String,
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: Vec<(u16, String)>,
    pub host_config: HostConfig,
}

/// The parts of a container inspection the daemon relies on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub pid: Option<i64>,
    pub running: bool,
    /// Container port key (`80/tcp`) to the host ports bound to it.
    pub ports: BTreeMap<String, Vec<String>>,
}

/// The container engine as seen by the deployment stages.
///
/// Implementations map "no such object" responses to the matching
/// not-found error variant.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str, sink: ProgressSink<'_>) -> Result<()>;
    async fn build_image(&self, request: BuildRequest, sink: ProgressSink<'_>) -> Result<()>;
    async fn inspect_image(&self, image: &str) -> Result<()>;
    async fn remove_image(&self, image: &str) -> Result<()>;

    async fn create_network(&self, name: &str) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;
    async fn connect_network(&self, network: &str, container: &str, aliases: Vec<String>) -> Result<()>;
    async fn network_gateway(&self, network: &str) -> Result<Option<String>>;

    /// Creates the container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, name: &str) -> Result<()>;
    async fn stop_container(&self, name: &str) -> Result<()>;
    /// Force-removes the container.
    async fn remove_container(&self, name: &str) -> Result<()>;
    async fn container_logs(&self, name: &str, tail: usize) -> Result<String>;
    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo>;
    /// Runs `command` inside the container and returns its exit code.
    async fn exec(&self, name: &str, command: &[String], user: &str) -> Result<i64>;
    async fn update_cpu_shares(&self, name: &str, shares: i64) -> Result<()>;
    /// Names of all containers, running or not.
    async fn list_containers(&self) -> Result<Vec<String>>;
}
