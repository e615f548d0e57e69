//! chuted entry point: applies one chute update read from a JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Deserialize;

use chuted::config::Config;
use chuted::netns::SystemRunner;
use chuted::runtime::DockerRuntime;
use chuted::types::Chute;
use chuted::update::{Update, UpdateCache};
use chuted::{pipeline, AgentContext};

#[derive(Parser)]
#[command(name = "chuted")]
#[command(author, version, about = "Deploys chutes as containers on a Paradrop router")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a new chute
    Install { update: PathBuf },
    /// Replace a chute with a new version
    Update { update: PathBuf },
    /// Stop a chute's containers
    Stop { update: PathBuf },
    /// Start a stopped chute
    Start { update: PathBuf },
    /// Remove a chute and its images
    Remove { update: PathBuf },
    /// Remove every container on the host
    FactoryReset { update: PathBuf },
}

/// Update file as written by the update supplier.
#[derive(Deserialize)]
struct UpdateFile {
    change_id: String,
    #[serde(default)]
    old: Option<Chute>,
    new: Chute,
    #[serde(default)]
    workdir: PathBuf,
    #[serde(default)]
    cache: UpdateCache,
}

fn read_update(path: &Path) -> anyhow::Result<Update> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: UpdateFile = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Update::new(file.change_id, file.old, file.new, file.workdir).with_cache(file.cache))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Config::load()?;
    info!("Starting chuted with config: {:?}", cfg);

    if chuted::containers::write_docker_config(&cfg.docker_conf_path) {
        info!("Wrote docker configuration to {}", cfg.docker_conf_path.display());
    }

    let ctx = AgentContext::new(cfg, Arc::new(DockerRuntime::new()), Arc::new(SystemRunner));

    let (path, op) = match &cli.command {
        Command::Install { update } => (update, "install"),
        Command::Update { update } => (update, "update"),
        Command::Stop { update } => (update, "stop"),
        Command::Start { update } => (update, "start"),
        Command::Remove { update } => (update, "remove"),
        Command::FactoryReset { update } => (update, "factory-reset"),
    };
    let mut update = read_update(path)?;

    let result = match cli.command {
        Command::Install { .. } => pipeline::install(&ctx, &mut update).await,
        Command::Update { .. } => pipeline::update(&ctx, &mut update).await,
        Command::Stop { .. } => pipeline::stop(&ctx, &mut update).await,
        Command::Start { .. } => pipeline::start(&ctx, &mut update).await,
        Command::Remove { .. } => pipeline::remove(&ctx, &mut update).await,
        Command::FactoryReset { .. } => pipeline::factory_reset(&ctx, &mut update).await,
    };

    for entry in update.progress.entries() {
        eprintln!("{}", entry);
    }
    println!("{}", serde_json::to_string_pretty(&update.cache)?);

    if let Err(err) = result {
        error!("{} of {} failed: {}", op, update.new.name, err);
        return Err(err.into());
    }
    info!("{} of {} complete", op, update.new.name);
    Ok(())
}
