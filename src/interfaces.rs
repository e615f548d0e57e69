//! Wiring host interfaces into chute containers and returning the ones the
//! kernel will not give back on its own.
//!
//! LAN, VLAN and Wi-Fi AP interfaces get a macvlan sub-interface that is
//! created on the host under a throwaway name, moved into the container's
//! namespace by pid and only then renamed, since several sub-interfaces of
//! one device would otherwise race for the final name.  Monitor-mode radios
//! cannot be virtualised this way, so the whole phy is moved and recorded as
//! a [`BorrowedInterface`].

use std::collections::HashMap;
use std::path::PathBuf;

use log::{info, warn};

use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::netns::{argv, call_in_netns, call_retry, container_pid, OnError, PLUMBING_TRIES};
use crate::types::{BorrowedInterface, InterfaceKind, NetworkInterface};
use crate::update::Update;

/// Plumbs every interface in the update cache into its service's container
/// and records the borrowed ones in the cache, including those borrowed
/// before a failure so cleanup can still return them.
pub async fn setup_net_interfaces(ctx: &AgentContext, update: &mut Update) -> Result<()> {
    let interfaces = update.cache.network_interfaces.clone();
    let mut borrowed = Vec::new();

    let result = plumb_all(ctx, update, &interfaces, &mut borrowed).await;
    update.cache.borrowed_interfaces = Some(borrowed);
    result
}

async fn plumb_all(
    ctx: &AgentContext,
    update: &Update,
    interfaces: &[NetworkInterface],
    borrowed: &mut Vec<BorrowedInterface>,
) -> Result<()> {
    let env = ctx.command_env();

    for iface in interfaces {
        let service = update.service(iface.service.as_deref())?;
        let container = service.container_name(update.chute_of(service));
        let pid = container_pid(ctx, &container).await?;
        let internal = iface.internal.as_str();

        match &iface.kind {
            InterfaceKind::Lan { external, address }
            | InterfaceKind::Vlan { external, address }
            | InterfaceKind::WifiAp { external, address } => {
                attach_macvlan(ctx, &env, &container, pid, internal, external, address).await?;
            }
            InterfaceKind::WifiMonitor { external, phy } => {
                host_command(ctx, &env, argv(&["iw", "phy", phy, "set", "netns", &pid.to_string()])).await?;
                borrowed.push(BorrowedInterface::Wifi {
                    container: container.clone(),
                    pid,
                    internal: internal.to_string(),
                    external: external.clone(),
                    phy: phy.clone(),
                });

                let rename = argv(&["ip", "link", "set", "dev", external, "up", "name", internal]);
                call_in_netns(ctx, &container, &rename, OnError::Raise, Some(pid)).await?;
            }
            InterfaceKind::LanPassthrough { external } => {
                if !ctx.config.allow_lan_passthrough {
                    warn!("{}: LAN passthrough of {} is disabled, skipping", container, external);
                    continue;
                }
                let pid_arg = pid.to_string();
                host_command(
                    ctx,
                    &env,
                    argv(&["ip", "link", "set", "dev", external, "up", "netns", &pid_arg, "name", internal]),
                )
                .await?;
                borrowed.push(BorrowedInterface::Lan {
                    container: container.clone(),
                    pid,
                    internal: internal.to_string(),
                    external: external.clone(),
                });
            }
        }
        info!("{}: attached {} as {}", container, describe(&iface.kind), internal);
    }
    Ok(())
}

async fn attach_macvlan(
    ctx: &AgentContext,
    env: &HashMap<String, String>,
    container: &str,
    pid: i64,
    internal: &str,
    external: &str,
    address: &str,
) -> Result<()> {
    let tmp = temporary_name();

    host_command(
        ctx,
        env,
        argv(&["ip", "link", "add", "link", external, "dev", &tmp, "type", "macvlan", "mode", "bridge"]),
    )
    .await?;
    let moved = async {
        host_command(ctx, env, argv(&["ip", "link", "set", &tmp, "up"])).await?;
        host_command(ctx, env, argv(&["ip", "link", "set", &tmp, "netns", &pid.to_string()])).await
    }
    .await;
    if let Err(err) = moved {
        // Still on the host, so it would outlive the update.
        if let Err(del) = host_command(ctx, env, argv(&["ip", "link", "del", &tmp])).await {
            warn!("{}: could not delete {}: {}", container, tmp, del);
        }
        return Err(err);
    }

    for command in [
        argv(&["ip", "link", "set", &tmp, "name", internal]),
        argv(&["ip", "addr", "add", address, "dev", internal]),
        argv(&["ip", "link", "set", internal, "up"]),
    ] {
        call_in_netns(ctx, container, &command, OnError::Raise, Some(pid)).await?;
    }
    Ok(())
}

/// Returns every borrowed interface in the update cache to the host.
///
/// Runs even when the containers are already gone, so every step is best
/// effort.  The borrowed list is consumed.
pub async fn cleanup_net_interfaces(ctx: &AgentContext, update: &mut Update) {
    let Some(borrowed) = update.cache.borrowed_interfaces.take() else {
        return;
    };

    for iface in borrowed {
        match &iface {
            BorrowedInterface::Wifi {
                container,
                pid,
                internal,
                external,
                phy,
            } => {
                let rename = argv(&["ip", "link", "set", "dev", internal, "down", "name", external]);
                best_effort(ctx, container, &rename, *pid).await;

                let give_back = argv(&["iw", "phy", phy, "set", "netns", "1"]);
                best_effort(ctx, container, &give_back, *pid).await;

                reset_wireless_device(ctx, phy, external).await;
            }
            BorrowedInterface::Lan {
                container,
                pid,
                internal,
                external,
            } => {
                let give_back = argv(&["ip", "link", "set", "dev", internal, "down", "netns", "1", "name", external]);
                best_effort(ctx, container, &give_back, *pid).await;
            }
        }
        info!("{}: returned borrowed interface to the host", iface.container());
    }
}

async fn best_effort(ctx: &AgentContext, container: &str, command: &[String], pid: i64) {
    if let Err(err) = call_in_netns(ctx, container, command, OnError::Ignore, Some(pid)).await {
        warn!("{}: `{}` failed: {}", container, command.join(" "), err);
    }
}

/// Leaves `phy` with exactly one managed interface named `primary`.
pub async fn reset_wireless_device(ctx: &AgentContext, phy: &str, primary: &str) {
    let env = ctx.command_env();
    let mut found = false;

    for name in phy_interfaces(ctx, phy).await {
        if name == primary {
            found = true;
            continue;
        }
        if let Err(err) = host_command(ctx, &env, argv(&["iw", "dev", &name, "del"])).await {
            warn!("{}: could not delete {}: {}", phy, name, err);
        }
    }

    let commands = if found {
        vec![
            argv(&["ip", "link", "set", "dev", primary, "down"]),
            argv(&["iw", "dev", primary, "set", "type", "managed"]),
        ]
    } else {
        vec![argv(&["iw", "phy", phy, "interface", "add", primary, "type", "managed"])]
    };
    for command in commands {
        if let Err(err) = host_command(ctx, &env, command).await {
            warn!("{}: reset of {} incomplete: {}", phy, primary, err);
            return;
        }
    }
}

/// Interfaces the kernel currently lists for `phy`.
async fn phy_interfaces(ctx: &AgentContext, phy: &str) -> Vec<String> {
    let dir: PathBuf = ctx
        .config
        .sysfs_root
        .join("class/ieee80211")
        .join(phy)
        .join("device/net");

    let mut names = Vec::new();
    match tokio::fs::read_dir(&dir).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(err) => warn!("Could not list interfaces of {}: {}", phy, err),
    }
    names.sort();
    names
}

/// Runs a command on the host; a non-zero exit is an error.
async fn host_command(ctx: &AgentContext, env: &HashMap<String, String>, command: Vec<String>) -> Result<()> {
    let code = call_retry(ctx.runner.as_ref(), &command, env, ctx.retry_delay(), PLUMBING_TRIES).await?;
    if code != 0 {
        return Err(Error::Command {
            command: command.join(" "),
            code,
        });
    }
    Ok(())
}

/// Unique name for a sub-interface while it is still on the host.
fn temporary_name() -> String {
    format!("tmp{}", hex::encode(rand::random::<[u8; 4]>()))
}

fn describe(kind: &InterfaceKind) -> &'static str {
    match kind {
        InterfaceKind::Lan { .. } => "lan",
        InterfaceKind::Vlan { .. } => "vlan",
        InterfaceKind::WifiAp { .. } => "wifi-ap",
        InterfaceKind::WifiMonitor { .. } => "wifi-monitor",
        InterfaceKind::LanPassthrough { .. } => "lan-passthrough",
    }
}
