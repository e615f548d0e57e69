//! Port binding resolution, keeping host ports stable across updates.

use log::{debug, warn};

use crate::context::AgentContext;
use crate::error::Result;
use crate::runtime::docker::normalize_port_key;
use crate::types::{Chute, Service};
use crate::update::{PortBindings, Update};

/// Computes the port bindings for `service` of `chute`.
///
/// Starts from the service's `port-bindings` request and adds an unbound
/// entry for the chute's web port when this service serves it.  Unbound
/// entries then inherit the host port the currently installed container got
/// for the same container port, so redirects to a chute survive an update.
pub async fn resolve_port_bindings(ctx: &AgentContext, chute: &Chute, service: &Service) -> Result<PortBindings> {
    let mut bindings = service.requests.port_bindings.clone();
    if service.name.is_none() {
        for (key, host) in &chute.host_config.port_bindings {
            bindings.entry(key.clone()).or_insert_with(|| host.clone());
        }
    }

    if let Some(port) = chute.web.port {
        if chute.web.service == service.name {
            let keys = [port.to_string(), format!("{}/tcp", port)];
            if !keys.iter().any(|k| bindings.contains_key(k)) {
                bindings.insert(format!("{}/tcp", port), None);
            }
        }
    }

    // Docker keys bindings as `port/proto`, so `80` and `80/tcp` are the
    // same port.  The explicit form wins; its host port falls back to the
    // bare entry's.
    let duplicates: Vec<String> = bindings
        .keys()
        .filter(|key| !key.contains('/') && bindings.contains_key(&normalize_port_key(key)))
        .cloned()
        .collect();
    for key in duplicates {
        if let Some(host) = bindings.remove(&key) {
            warn!("{}: port binding {} duplicates {}/tcp", chute.name, key, key);
            let kept = bindings.entry(normalize_port_key(&key)).or_default();
            if kept.is_none() {
                *kept = host;
            }
        }
    }

    let container_name = service.container_name(chute);
    let previous = match ctx.runtime.inspect_container(&container_name).await {
        Ok(info) => info.ports,
        Err(err) if err.is_not_found() => Default::default(),
        Err(err) => return Err(err),
    };

    for (key, host) in bindings.iter_mut() {
        if host.is_some() {
            continue;
        }
        let inherited = previous
            .get(key)
            .or_else(|| previous.get(&normalize_port_key(key)))
            .and_then(|ports| ports.first());
        if let Some(port) = inherited {
            debug!("{}: inheriting host port {} for {}", container_name, port, key);
            *host = Some(port.clone());
        }
    }

    Ok(bindings)
}

/// Resolves the bindings for the named service and stores them in the
/// update cache for the container start stage.
pub async fn prepare_port_bindings(ctx: &AgentContext, update: &mut Update, service: Option<&str>) -> Result<PortBindings> {
    let service = update.service(service)?.clone();
    let bindings = resolve_port_bindings(ctx, update.chute_of(&service), &service).await?;
    update.cache.set_port_bindings(&service, bindings.clone());
    Ok(bindings)
}

/// Container ports to expose, as `(port, protocol)` pairs.  Keys are `port`
/// or `port/protocol`; the protocol defaults to tcp.
pub fn port_list(bindings: &PortBindings, web_port: Option<u16>) -> Vec<(u16, String)> {
    let mut ports: Vec<(u16, String)> = Vec::new();
    for key in bindings.keys() {
        let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        match port.parse::<u16>() {
            Ok(port) => ports.push((port, proto.to_string())),
            Err(_) => warn!("Ignoring malformed port binding key {:?}", key),
        }
    }

    if let Some(web_port) = web_port {
        if !ports.iter().any(|(p, _)| *p == web_port) {
            ports.push((web_port, "tcp".to_string()));
        }
    }
    ports
}
