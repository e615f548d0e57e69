use super::{BuildRequest, ContainerInfo, ContainerRuntime, ContainerSpec, ProgressRecord, ProgressSink};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bollard::models::{
    BuildInfo, CreateImageInfo, EndpointSettings, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};

/// Talks to the local Docker daemon.  Every call opens a fresh client, so no
/// connection state is shared between deployment stages.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    fn connect() -> Result<Docker> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str, sink: ProgressSink<'_>) -> Result<()> {
        let docker = Self::connect()?;
        let (from_image, tag) = split_image_tag(image);
        let opts = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut stream = Box::pin(docker.create_image(Some(opts), None, None));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| not_found(e, || Error::ImageNotFound(image.to_string())))?;
            sink(pull_record(info));
        }
        Ok(())
    }

    async fn build_image(&self, request: BuildRequest, sink: ProgressSink<'_>) -> Result<()> {
        let docker = Self::connect()?;
        info!("Building image {} ({} byte context)", request.tag, request.context.len());
        let opts = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: request.tag.clone(),
            rm: true,
            pull: request.pull,
            ..Default::default()
        };

        let mut stream = Box::pin(docker.build_image(opts, None, Some(Bytes::from(request.context))));
        while let Some(item) = stream.next().await {
            sink(build_record(item?));
        }
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<()> {
        let docker = Self::connect()?;
        docker
            .inspect_image(image)
            .await
            .map_err(|e| not_found(e, || Error::ImageNotFound(image.to_string())))?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let docker = Self::connect()?;
        docker
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await
            .map_err(|e| not_found(e, || Error::ImageNotFound(image.to_string())))?;
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let docker = Self::connect()?;
        let opts = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        docker.create_network(opts).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let docker = Self::connect()?;
        docker
            .remove_network(name)
            .await
            .map_err(|e| not_found(e, || Error::NetworkNotFound(name.to_string())))
    }

    async fn connect_network(&self, network: &str, container: &str, aliases: Vec<String>) -> Result<()> {
        let docker = Self::connect()?;
        let opts = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings {
                aliases: Some(aliases),
                ..Default::default()
            },
        };
        docker
            .connect_network(network, opts)
            .await
            .map_err(|e| not_found(e, || Error::NetworkNotFound(network.to_string())))
    }

    async fn network_gateway(&self, network: &str) -> Result<Option<String>> {
        let docker = Self::connect()?;
        let detail = docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| not_found(e, || Error::NetworkNotFound(network.to_string())))?;

        Ok(detail
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .find_map(|config| config.gateway.filter(|gw| !gw.is_empty())))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let docker = Self::connect()?;
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = docker
            .create_container(Some(opts), container_config(spec))
            .await
            .map_err(|e| not_found(e, || Error::ImageNotFound(spec.image.clone())))?;
        for warning in response.warnings {
            debug!("create {}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let docker = Self::connect()?;
        docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let docker = Self::connect()?;
        docker
            .stop_container(name, None)
            .await
            .map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let docker = Self::connect()?;
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        docker
            .remove_container(name, Some(opts))
            .await
            .map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String> {
        let docker = Self::connect()?;
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut logs = String::new();
        let mut stream = Box::pin(docker.logs(name, Some(opts)));
        while let Some(item) = stream.next().await {
            let chunk = item.map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))?;
            logs.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(logs)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        let docker = Self::connect()?;
        let detail = docker
            .inspect_container(name, None)
            .await
            .map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))?;

        let state = detail.state.unwrap_or_default();
        Ok(ContainerInfo {
            id: detail.id.unwrap_or_default(),
            pid: state.pid.filter(|pid| *pid > 0),
            running: state.running.unwrap_or(false),
            ports: host_ports(detail.network_settings.and_then(|s| s.ports)),
        })
    }

    async fn exec(&self, name: &str, command: &[String], user: &str) -> Result<i64> {
        let docker = Self::connect()?;
        let opts = CreateExecOptions {
            cmd: Some(command.to_vec()),
            user: Some(user.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = docker
            .create_exec(name, opts)
            .await
            .map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))?;

        if let StartExecResults::Attached { mut output, .. } = docker.start_exec(&exec.id, None).await? {
            while let Some(chunk) = output.next().await {
                debug!("{} exec: {}", name, String::from_utf8_lossy(&chunk?.into_bytes()).trim_end());
            }
        }

        let inspect = docker.inspect_exec(&exec.id).await?;
        Ok(exec_exit_code(inspect.running, inspect.exit_code))
    }

    async fn update_cpu_shares(&self, name: &str, shares: i64) -> Result<()> {
        let docker = Self::connect()?;
        let opts = UpdateContainerOptions::<String> {
            cpu_shares: Some(shares as isize),
            ..Default::default()
        };
        docker
            .update_container(name, opts)
            .await
            .map_err(|e| not_found(e, || Error::ContainerNotFound(name.to_string())))
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let docker = Self::connect()?;
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string());
                name.or(c.id)
            })
            .collect())
    }
}

/// Exit code of a finished exec.  An exec that is still running or reports
/// no code has not succeeded.
fn exec_exit_code(running: Option<bool>, exit_code: Option<i64>) -> i64 {
    match (running, exit_code) {
        (Some(true), _) | (_, None) => -1,
        (_, Some(code)) => code,
    }
}

fn not_found(err: DockerError, missing: impl FnOnce() -> Error) -> Error {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => missing(),
        other => Error::Docker(other),
    }
}

/// Splits `repo[:tag]`, defaulting the tag so the engine does not pull every
/// tag of the repository.
fn split_image_tag(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

fn pull_record(info: CreateImageInfo) -> ProgressRecord {
    let has_progress_detail = info
        .progress_detail
        .map_or(false, |d| d.current.is_some() || d.total.is_some());
    ProgressRecord {
        status: info.status,
        id: info.id,
        progress: info.progress,
        error_detail: info.error.clone(),
        error: info.error,
        has_progress_detail,
        ..Default::default()
    }
}

fn build_record(info: BuildInfo) -> ProgressRecord {
    let has_progress_detail = info
        .progress_detail
        .map_or(false, |d| d.current.is_some() || d.total.is_some());
    ProgressRecord {
        status: info.status,
        id: info.id,
        stream: info.stream,
        progress: info.progress,
        error: info.error,
        has_progress_detail,
        error_detail: info
            .error_detail
            .map(|d| d.message.unwrap_or_default()),
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let host = &spec.host_config;

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = host
        .port_bindings
        .iter()
        .map(|(key, host_port)| {
            let binding = PortBinding {
                host_ip: None,
                host_port: Some(host_port.clone().unwrap_or_default()),
            };
            (normalize_port_key(key), Some(vec![binding]))
        })
        .collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports
        .iter()
        .map(|(port, proto)| (format!("{}/{}", port, proto), HashMap::new()))
        .collect();

    let host_config = HostConfig {
        cap_add: Some(host.cap_add.clone()),
        cap_drop: Some(host.cap_drop.clone()),
        dns_search: Some(host.dns_search.clone()),
        extra_hosts: Some(
            host.extra_hosts
                .iter()
                .map(|(name, ip)| format!("{}:{}", name, ip))
                .collect(),
        ),
        network_mode: Some(host.network_mode.clone()),
        port_bindings: Some(port_bindings),
        privileged: Some(host.privileged),
        publish_all_ports: Some(host.publish_all_ports),
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy_name(&host.restart_policy)),
            maximum_retry_count: None,
        }),
        binds: Some(host.binds.clone()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

/// Docker keys port bindings as `port/proto`; bare ports mean tcp.
pub(crate) fn normalize_port_key(key: &str) -> String {
    if key.contains('/') {
        key.to_string()
    } else {
        format!("{}/tcp", key)
    }
}

fn host_ports(ports: Option<HashMap<String, Option<Vec<PortBinding>>>>) -> BTreeMap<String, Vec<String>> {
    ports
        .unwrap_or_default()
        .into_iter()
        .map(|(key, bindings)| {
            let host: Vec<String> = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| b.host_port)
                .filter(|p| !p.is_empty())
                .collect();
            (key, host)
        })
        .collect()
}
