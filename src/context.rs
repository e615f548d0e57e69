//! Process-wide collaborators, built once in `main` and passed to every
//! deployment stage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::image::ImageWorkers;
use crate::netns::CommandRunner;
use crate::runtime::ContainerRuntime;

#[derive(Clone)]
pub struct AgentContext {
    pub config: Config,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub runner: Arc<dyn CommandRunner>,
    pub images: ImageWorkers,
}

impl AgentContext {
    /// Must be called from within a tokio runtime; image workers are spawned
    /// here.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>, runner: Arc<dyn CommandRunner>) -> Self {
        let images = ImageWorkers::spawn(Arc::clone(&runtime), config.image_workers);
        Self {
            config,
            runtime,
            runner,
            images,
        }
    }

    pub fn router_id(&self) -> &str {
        &self.config.router_id
    }

    pub fn local_domain(&self) -> &str {
        &self.config.local_domain
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.config.retry_delay_secs)
    }

    /// Environment for host tool invocations: the daemon's `PATH` plus the
    /// directory holding the container tooling.
    pub fn command_env(&self) -> HashMap<String, String> {
        let mut path = std::env::var("PATH").unwrap_or_else(|_| "/bin".to_string());
        let bin_dir = &self.config.docker_bin_dir;
        if !bin_dir.is_empty() && !path.split(':').any(|p| p == bin_dir) {
            path.push(':');
            path.push_str(bin_dir);
        }
        HashMap::from([("PATH".to_string(), path)])
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("config", &self.config)
            .field("images", &self.images)
            .finish()
    }
}
