//! Container and bridge network lifecycle for chute services.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};

use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::ports::port_list;
use crate::runtime::{ContainerSpec, HostConfig};
use crate::types::Service;
use crate::update::Update;

/// Lines of container output kept in the progress log on removal.
const LOG_TAIL: usize = 40;

const DEFAULT_GATEWAY: &str = "172.17.0.1";

const DOCKER_CONF: &str = "
# Docker systemd configuration
#
# This configuration file was automatically generated by chuted.  Any changes
# will be overwritten on startup.

# Tell docker not to start containers automatically on startup.
DOCKER_OPTIONS=\"--restart=false\"
";

/// Creates the chute's own bridge network, named after the chute.
pub async fn create_bridge(ctx: &AgentContext, update: &Update) -> Result<()> {
    info!("Creating bridge network {}", update.new.name);
    ctx.runtime.create_network(&update.new.name).await
}

/// Removes the chute's bridge network; a missing network is fine.
pub async fn remove_bridge(ctx: &AgentContext, update: &Update) -> Result<()> {
    match ctx.runtime.remove_network(&update.new.name).await {
        Err(Error::NetworkNotFound(_)) => Ok(()),
        other => other,
    }
}

/// Address of the host as seen from containers on the default bridge.
pub async fn bridge_gateway(ctx: &AgentContext) -> String {
    match ctx.runtime.network_gateway("bridge").await {
        Ok(Some(gateway)) => gateway,
        Ok(None) | Err(_) => {
            warn!("Could not find bridge gateway, using default");
            DEFAULT_GATEWAY.to_string()
        }
    }
}

/// Host settings for the container of `service`.
pub async fn build_host_config(ctx: &AgentContext, update: &Update, service: &Service) -> HostConfig {
    let requests = &service.requests;
    let network_mode = requests
        .network_mode
        .clone()
        .unwrap_or_else(|| "bridge".to_string());

    // Host networking shares /etc/hosts with the host, so no extra entries.
    let mut extra_hosts = BTreeMap::new();
    if network_mode != "host" {
        extra_hosts.insert(ctx.local_domain().to_string(), bridge_gateway(ctx).await);
    }

    let port_bindings = update
        .cache
        .port_bindings_for(service)
        .cloned()
        .unwrap_or_else(|| requests.port_bindings.clone());

    HostConfig {
        cap_add: vec!["NET_ADMIN".to_string()],
        cap_drop: Vec::new(),
        dns_search: Vec::new(),
        extra_hosts,
        network_mode,
        port_bindings,
        privileged: requests.privileged,
        publish_all_ports: false,
        restart_policy: "no".to_string(),
        binds: update.cache.volumes.clone(),
    }
}

/// Environment for the container of `service`: chute variables, then the
/// service's own, then the `PARADROP_*` variables describing the router.
pub fn prepare_environment(ctx: &AgentContext, update: &Update, service: &Service) -> BTreeMap<String, String> {
    let chute = &update.new;
    let domain = ctx.local_domain();
    let cache = &update.cache;

    let mut env = chute.environment.clone();
    env.extend(service.environment.clone());

    let injected = [
        ("PARADROP_CHUTE_NAME", chute.name.clone()),
        ("PARADROP_FEATURES", ctx.config.features.clone()),
        ("PARADROP_ROUTER_ID", ctx.router_id().to_string()),
        ("PARADROP_DATA_DIR", cache.internal_data_dir.clone().unwrap_or_default()),
        ("PARADROP_SYSTEM_DIR", cache.internal_system_dir.clone().unwrap_or_default()),
        ("PARADROP_API_URL", format!("http://{}/api", domain)),
        ("PARADROP_BASE_URL", format!("http://{}/api/v1/chutes/{}", domain, chute.name)),
        ("PARADROP_API_TOKEN", cache.api_token.clone().unwrap_or_default()),
        ("PARADROP_WS_API_URL", format!("ws://{}/ws", domain)),
        ("PARADROP_CHUTE_VERSION", chute.version.clone()),
    ];
    for (key, value) in injected {
        env.insert(key.to_string(), value);
    }
    env
}

/// Creates and starts the container for `service`, then joins it to the
/// chute bridge under the service name.
pub async fn start_container(ctx: &AgentContext, update: &Update, service: &Service) -> Result<()> {
    let chute = update.chute_of(service);
    let name = service.container_name(chute);
    let image = service.image_name(chute);
    info!("Attempting to start container {} from image {}", name, image);

    let host_config = build_host_config(ctx, update, service).await;
    let web_port = chute
        .web
        .port
        .filter(|_| chute.web.service == service.name);
    let spec = ContainerSpec {
        name: name.clone(),
        image,
        env: prepare_environment(ctx, update, service),
        exposed_ports: port_list(&host_config.port_bindings, web_port),
        host_config,
    };

    let id = ctx.runtime.create_container(&spec).await?;
    ctx.runtime.start_container(&name).await?;
    update.progress(format!("Successfully started chute with Id: {}", id));

    if spec.host_config.network_mode == "host" {
        return Ok(());
    }
    let alias = service.name.clone().unwrap_or_else(|| chute.name.clone());
    match ctx
        .runtime
        .connect_network(&update.new.name, &name, vec![alias])
        .await
    {
        Ok(()) => Ok(()),
        Err(Error::NetworkNotFound(network)) => {
            warn!(
                "Bridge network {} not found; connectivity between containers is limited.",
                network
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

pub async fn stop_container(ctx: &AgentContext, update: &Update, service: &Service) -> Result<()> {
    let name = service.container_name(update.chute_of(service));
    info!("Attempting to stop container {}", name);
    ctx.runtime.stop_container(&name).await
}

pub async fn restart_container(ctx: &AgentContext, update: &Update, service: &Service) -> Result<()> {
    let name = service.container_name(update.chute_of(service));
    info!("Attempting to restart container {}", name);
    ctx.runtime.start_container(&name).await
}

/// Removes the container for `service`, keeping its last log lines in the
/// progress log.  Never fails; removal must not block the rest of an update.
pub async fn remove_container(ctx: &AgentContext, update: &Update, service: &Service) {
    let name = service.container_name(update.chute_of(service));
    info!("Removing container {}", name);

    match ctx.runtime.container_logs(&name, LOG_TAIL).await {
        Ok(logs) => update.progress(format!("{}: {}", name, logs.trim_end())),
        Err(err) if err.is_not_found() => {}
        Err(err) => warn!("Could not read logs of {}: {}", name, err),
    }

    match ctx.runtime.remove_container(&name).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => info!("Container {} already removed", name),
        Err(err) => warn!("Error removing container: {}", err),
    }
}

/// Removes every container on the host.  Only for factory reset.
pub async fn remove_all_containers(ctx: &AgentContext, update: &Update) -> Result<()> {
    for name in ctx.runtime.list_containers().await? {
        if let Err(err) = ctx.runtime.remove_container(&name).await {
            update.progress(err.to_string());
        }
    }
    Ok(())
}

/// Writes the Docker daemon options that keep it from restarting containers
/// on boot.  Returns whether the file was written.
pub fn write_docker_config(path: &Path) -> bool {
    let mut written = false;
    if path.exists() {
        match std::fs::write(path, DOCKER_CONF) {
            Ok(()) => written = true,
            Err(err) => warn!("Error writing to {}: {}", path.display(), err),
        }
    }

    if !written {
        warn!("Could not write docker configuration.");
    }
    written
}
