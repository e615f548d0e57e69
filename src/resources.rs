//! CPU shares and traffic-class tagging for chute containers.
//!
//! Shaping by class happens elsewhere (the QoS configuration); this module
//! only tags each container's `net_cls` cgroup.  Class ids are hexadecimal
//! `major:minor`, see the kernel's cgroup-v1 `net_cls` documentation.

use std::path::PathBuf;

use log::{info, warn};

use crate::context::AgentContext;
use crate::error::Result;
use crate::update::{Allocation, Update};

/// Class 1:1.
pub const PRIORITY_CLASSID: &str = "0x10001";
/// Class 1:3.
pub const BEST_EFFORT_CLASSID: &str = "0x10003";

pub async fn set_resource_allocation(ctx: &AgentContext, update: &Update) -> Result<()> {
    apply_allocation(ctx, &update.cache.new_resource_allocation).await
}

pub async fn revert_resource_allocation(ctx: &AgentContext, update: &Update) -> Result<()> {
    apply_allocation(ctx, &update.cache.old_resource_allocation).await
}

async fn apply_allocation(ctx: &AgentContext, allocation: &Allocation) -> Result<()> {
    for (container, resources) in allocation {
        info!("Update chute {} set cpu_shares={}", container, resources.cpu_shares);
        ctx.runtime
            .update_cpu_shares(container, resources.cpu_shares)
            .await?;

        let classid = if resources.prioritize_traffic {
            PRIORITY_CLASSID
        } else {
            BEST_EFFORT_CLASSID
        };
        if let Err(err) = write_classid(ctx, container, classid).await {
            warn!("Error setting traffic class for {}: {}", container, err);
        }
    }
    Ok(())
}

async fn write_classid(ctx: &AgentContext, container: &str, classid: &str) -> Result<()> {
    let id = ctx.runtime.inspect_container(container).await?.id;
    tokio::fs::write(classid_path(ctx, &id), classid).await?;
    Ok(())
}

fn classid_path(ctx: &AgentContext, container_id: &str) -> PathBuf {
    ctx.config
        .cgroup_root
        .join("net_cls/docker")
        .join(container_id)
        .join("net_cls.classid")
}
