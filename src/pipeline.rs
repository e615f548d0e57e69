//! Deployment transactions built from the individual stages.
//!
//! Stages run in a fixed order: images before containers, the bridge before
//! anything connects to it, containers before interface plumbing, and
//! running containers before resource allocation.  Install and update undo
//! what they can when a stage fails and then return the original error.

use log::{info, warn};

use crate::containers;
use crate::context::AgentContext;
use crate::error::Result;
use crate::image;
use crate::interfaces::{cleanup_net_interfaces, setup_net_interfaces};
use crate::ports::prepare_port_bindings;
use crate::resources::{revert_resource_allocation, set_resource_allocation};
use crate::types::Service;
use crate::update::Update;

pub async fn install(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    info!("Installing chute {} ({})", update.new.name, update.change_id);
    let result = install_stages(ctx, update).await;
    if let Err(err) = &result {
        update.progress(format!("Install failed: {}", err));
        rollback(ctx, update, true).await;
    }
    result
}

async fn install_stages(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    let services = update.new.services.clone();
    for service in &services {
        image::prepare_image(ctx, update, service).await?;
    }
    containers::create_bridge(ctx, update).await?;
    start_services(ctx, update, &services).await?;
    setup_net_interfaces(ctx, update).await?;
    set_resource_allocation(ctx, update).await
}

/// Replaces the old chute's containers with the new version's.
pub async fn update(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    info!("Updating chute {} ({})", update.new.name, update.change_id);
    let result = update_stages(ctx, update).await;
    if let Err(err) = &result {
        update.progress(format!("Update failed: {}", err));
        rollback(ctx, update, false).await;
    }
    result
}

async fn update_stages(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    let services = update.new.services.clone();
    for service in &services {
        image::prepare_image(ctx, update, service).await?;
    }

    // Host ports are inherited from the old containers, so resolve them
    // while those containers still exist.
    for service in &services {
        prepare_port_bindings(ctx, update, service.name.as_deref()).await?;
    }

    cleanup_net_interfaces(ctx, update).await;
    let old_services = update
        .old
        .as_ref()
        .map(|old| old.services.clone())
        .unwrap_or_default();
    for service in &old_services {
        containers::remove_container(ctx, update, service).await;
    }

    containers::remove_bridge(ctx, update).await?;
    containers::create_bridge(ctx, update).await?;
    start_services(ctx, update, &services).await?;
    setup_net_interfaces(ctx, update).await?;
    set_resource_allocation(ctx, update).await
}

pub async fn stop(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    info!("Stopping chute {} ({})", update.new.name, update.change_id);
    cleanup_net_interfaces(ctx, update).await;
    for service in update.new.services.clone() {
        containers::stop_container(ctx, update, &service).await?;
    }
    Ok(())
}

/// Starts the containers of an installed chute again.  Every image must
/// still be present before any container is started.
pub async fn start(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    info!("Starting chute {} ({})", update.new.name, update.change_id);
    let services = update.new.services.clone();
    for service in &services {
        image::check_image(ctx, update, service).await?;
    }
    for service in &services {
        containers::restart_container(ctx, update, service).await?;
    }
    setup_net_interfaces(ctx, update).await?;
    set_resource_allocation(ctx, update).await
}

/// Tears the chute down.  Absent containers, images and bridge are not
/// errors.
pub async fn remove(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    info!("Removing chute {} ({})", update.new.name, update.change_id);
    cleanup_net_interfaces(ctx, update).await;
    let services = update.new.services.clone();
    for service in &services {
        containers::remove_container(ctx, update, service).await;
    }
    for service in &services {
        image::remove_image(ctx, update, service).await;
    }
    containers::remove_bridge(ctx, update).await?;
    set_resource_allocation(ctx, update).await
}

/// Removes every container on the host and rewrites the daemon options.
pub async fn factory_reset(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    warn!("Factory reset requested ({})", update.change_id);
    containers::remove_all_containers(ctx, update).await?;
    containers::write_docker_config(&ctx.config.docker_conf_path);
    Ok(())
}

async fn start_services(ctx: &AgentContext, update: &mut Update, services: &[Service]) -> Result<()> {
    for service in services {
        if update.cache.port_bindings_for(service).is_none() {
            prepare_port_bindings(ctx, update, service.name.as_deref()).await?;
        }
        containers::start_container(ctx, update, service).await?;
    }
    Ok(())
}

async fn rollback(ctx: &AgentContext, update: &mut Update, remove_bridge: bool) {
    warn!("Rolling back {} ({})", update.new.name, update.change_id);
    if let Err(err) = revert_resource_allocation(ctx, update).await {
        warn!("Error reverting resource allocation: {}", err);
    }
    cleanup_net_interfaces(ctx, update).await;
    for service in update.new.services.clone() {
        containers::remove_container(ctx, update, &service).await;
    }
    if remove_bridge {
        if let Err(err) = containers::remove_bridge(ctx, update).await {
            warn!("Error removing bridge: {}", err);
        }
    }
}
