use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub router_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id_file: Option<PathBuf>,
    /// Host name chutes use to reach the router.
    pub local_domain: String,
    /// Appended to `PATH` for `ip`, `iw` and `nsenter` invocations.
    pub docker_bin_dir: String,
    pub image_workers: usize,
    pub allow_lan_passthrough: bool,
    pub cgroup_root: PathBuf,
    pub sysfs_root: PathBuf,
    pub docker_conf_path: PathBuf,
    pub features: String,
    pub retry_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router_id: String::new(),
            router_id_file: None,
            local_domain: "paradrop.io".into(),
            docker_bin_dir: "/usr/local/bin".into(),
            image_workers: 1,
            allow_lan_passthrough: false,
            cgroup_root: "/sys/fs/cgroup".into(),
            sysfs_root: "/sys".into(),
            docker_conf_path: "/var/snap/docker/current/etc/docker/docker.conf".into(),
            features: "hostapd-control".into(),
            retry_delay_secs: 3,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("chuted.toml"))
            .merge(Json::file("chuted.json"))
            .merge(Env::prefixed("CHUTED_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // The router identity is provisioned into a file on most devices.
        if let Some(ref path) = config.router_id_file {
            config.router_id = std::fs::read_to_string(path)?.trim().to_string();
        }

        if config.image_workers == 0 {
            config.image_workers = 1;
        }

        Ok(config)
    }
}
