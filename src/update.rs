//! The update record: one deployment transaction and the values its stages
//! hand to each other.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BorrowedInterface, Chute, NetworkInterface, ResourceAllocation, Service};

/// Resolved port bindings: container port key to host port (`None` lets
/// the runtime pick one).
pub type PortBindings = BTreeMap<String, Option<String>>;

/// Container name to resource limits.
pub type Allocation = BTreeMap<String, ResourceAllocation>;

/// Values computed by one stage of an update and consumed by later or
/// rollback stages.  Scoped to a single transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCache {
    /// Keyed by service name (empty string for a legacy unnamed service).
    #[serde(default)]
    pub port_bindings: BTreeMap<String, PortBindings>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub borrowed_interfaces: Option<Vec<BorrowedInterface>>,
    #[serde(default)]
    pub new_resource_allocation: Allocation,
    #[serde(default)]
    pub old_resource_allocation: Allocation,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub internal_data_dir: Option<String>,
    #[serde(default)]
    pub internal_system_dir: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl UpdateCache {
    pub fn port_bindings_for(&self, service: &Service) -> Option<&PortBindings> {
        self.port_bindings.get(binding_key(service))
    }

    pub fn set_port_bindings(&mut self, service: &Service, bindings: PortBindings) {
        self.port_bindings
            .insert(binding_key(service).to_string(), bindings);
    }
}

fn binding_key(service: &Service) -> &str {
    service.name.as_deref().unwrap_or_default()
}

/// Append-only progress log shared between the update and image workers.
#[derive(Debug, Clone, Default)]
pub struct ProgressLog {
    tag: Arc<str>,
    entries: Arc<Mutex<Vec<String>>>,
}

impl ProgressLog {
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self {
            tag: tag.into(),
            entries: Arc::default(),
        }
    }

    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        info!("[{}] {}", self.tag, message);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A single deployment transaction.
#[derive(Debug, Clone)]
pub struct Update {
    pub change_id: String,
    pub old: Option<Chute>,
    pub new: Chute,
    pub workdir: PathBuf,
    pub progress: ProgressLog,
    pub cache: UpdateCache,
}

impl Update {
    pub fn new(change_id: impl Into<String>, old: Option<Chute>, new: Chute, workdir: PathBuf) -> Self {
        let change_id = change_id.into();
        let progress = ProgressLog::new(format!("{}:{}", new.name, change_id));
        Self {
            change_id,
            old,
            new,
            workdir,
            progress,
            cache: UpdateCache::default(),
        }
    }

    pub fn with_cache(mut self, cache: UpdateCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.progress.push(message);
    }

    /// Looks a service up in the new chute, then the old one.
    pub fn service(&self, name: Option<&str>) -> Result<&Service> {
        self.new
            .service(name)
            .or_else(|| self.old.as_ref().and_then(|old| old.service(name)))
            .ok_or_else(|| Error::ServiceNotFound(name.unwrap_or("<unnamed>").to_string()))
    }

    /// The chute that owns `service`: the new one if it declares it, else
    /// the old one.
    pub fn chute_of(&self, service: &Service) -> &Chute {
        let name = service.name.as_deref();
        match (&self.old, self.new.service(name)) {
            (Some(old), None) if old.service(name).is_some() => old,
            _ => &self.new,
        }
    }
}
