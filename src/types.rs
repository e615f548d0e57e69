//! Data structures shared by every stage of a chute deployment.
//!
//! Chutes and services arrive already parsed (the external pipeline owns the
//! chute description format) and are deserialised with
//! [`serde`](https://serde.rs/) from the update description handed to the
//! daemon.  Network interfaces and borrowed interfaces are closed enums so
//! that setup and cleanup can match on them exhaustively.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// A user-deployed application made of one or more services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chute {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub web: WebSpec,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Host options from single-service chutes that predate per-service
    /// requests.
    #[serde(default)]
    pub host_config: HostOptions,
}

impl Chute {
    /// Finds a service by name.  `None` addresses the unnamed service of a
    /// legacy single-service chute.
    pub fn service(&self, name: Option<&str>) -> Option<&Service> {
        self.services.iter().find(|s| s.name.as_deref() == name)
    }
}

/// Which service, if any, is exposed through the router's web proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSpec {
    pub port: Option<u16>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostOptions {
    #[serde(default, deserialize_with = "de_port_bindings")]
    pub port_bindings: BTreeMap<String, Option<String>>,
}

/// How the image for a service is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Pulled pre-built from a registry.
    Image,
    /// Built from a Dockerfile carried inline in the service.
    Inline,
    /// Built from a Dockerfile synthesised from a simplified spec.
    Light,
    /// Built from the Dockerfile in the update's working directory.
    #[default]
    Normal,
}

/// One container-producing unit of a chute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ServiceType,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub build: BuildSpec,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub requests: Requests,
}

impl Service {
    /// Name of the container running this service.
    ///
    /// Legacy single-service chutes have no service name and their container
    /// is named after the chute.
    pub fn container_name(&self, chute: &Chute) -> String {
        match &self.name {
            None => chute.name.clone(),
            Some(name) => format!("{}-{}", chute.name, name),
        }
    }

    /// Name of the image the container runs.
    ///
    /// Light services declare a shorthand base such as `python3` in the image
    /// field; it is never a registry reference, so their image is always the
    /// locally built `<container>:<version>`.
    pub fn image_name(&self, chute: &Chute) -> String {
        match (&self.image, self.kind) {
            (Some(image), kind) if kind != ServiceType::Light => image.clone(),
            _ => format!("{}:{}", self.container_name(chute), chute.version),
        }
    }
}

/// Container command, either a shell string or an exec-form list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Free-form runtime requests of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requests {
    #[serde(default, rename = "network-mode")]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(
        default,
        rename = "port-bindings",
        deserialize_with = "de_port_bindings"
    )]
    pub port_bindings: BTreeMap<String, Option<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

/// Port binding maps allow host ports as numbers, strings or null.
fn de_port_bindings<'de, D>(deserializer: D) -> Result<BTreeMap<String, Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Option<PortValue>> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let port = value.map(|v| match v {
                PortValue::Number(n) => n.to_string(),
                PortValue::Text(s) => s,
            });
            (key, port)
        })
        .collect())
}

/// A host interface resolved for a service by the host configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Service that receives the interface; `None` for legacy chutes.
    #[serde(default)]
    pub service: Option<String>,
    /// Name the interface carries inside the container.
    pub internal: String,
    #[serde(flatten)]
    pub kind: InterfaceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InterfaceKind {
    Lan { external: String, address: String },
    Vlan { external: String, address: String },
    WifiAp { external: String, address: String },
    /// The whole radio is loaned to the container.
    WifiMonitor { external: String, phy: String },
    /// The physical LAN device itself is loaned to the container.
    LanPassthrough { external: String },
}

/// A host device moved into a container namespace that the kernel will not
/// hand back on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BorrowedInterface {
    Wifi {
        container: String,
        pid: i64,
        internal: String,
        external: String,
        phy: String,
    },
    Lan {
        container: String,
        pid: i64,
        internal: String,
        external: String,
    },
}

impl BorrowedInterface {
    pub fn container(&self) -> &str {
        match self {
            BorrowedInterface::Wifi { container, .. } | BorrowedInterface::Lan { container, .. } => {
                container
            }
        }
    }
}

/// Compute and traffic limits for one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_shares: i64,
    #[serde(default)]
    pub prioritize_traffic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chute() -> Chute {
        Chute {
            name: "hello".into(),
            version: "7".into(),
            ..Default::default()
        }
    }

    #[test]
    fn container_name_uses_chute_name_for_legacy_service() {
        let chute = chute();
        for kind in [ServiceType::Image, ServiceType::Light, ServiceType::Normal] {
            let service = Service {
                kind,
                ..Default::default()
            };
            assert_eq!(service.container_name(&chute), "hello");
        }
    }

    #[test]
    fn container_name_joins_chute_and_service() {
        let chute = chute();
        let service = Service {
            name: Some("web".into()),
            kind: ServiceType::Inline,
            ..Default::default()
        };
        assert_eq!(service.container_name(&chute), "hello-web");
    }

    #[test]
    fn light_image_name_ignores_declared_image() {
        let chute = chute();
        let service = Service {
            name: Some("api".into()),
            kind: ServiceType::Light,
            image: Some("python3".into()),
            ..Default::default()
        };
        assert_eq!(service.image_name(&chute), "hello-api:7");
    }

    #[test]
    fn image_service_uses_declared_image() {
        let chute = chute();
        let service = Service {
            name: Some("db".into()),
            kind: ServiceType::Image,
            image: Some("redis:6".into()),
            ..Default::default()
        };
        assert_eq!(service.image_name(&chute), "redis:6");
    }

    #[test]
    fn service_parses_mixed_port_bindings() {
        let service: Service = serde_json::from_value(serde_json::json!({
            "name": "web",
            "type": "image",
            "image": "nginx",
            "requests": {
                "network-mode": "bridge",
                "port-bindings": { "80": 8080, "443/tcp": "8443", "53/udp": null }
            }
        }))
        .unwrap();

        let bindings = &service.requests.port_bindings;
        assert_eq!(bindings["80"], Some("8080".to_string()));
        assert_eq!(bindings["443/tcp"], Some("8443".to_string()));
        assert_eq!(bindings["53/udp"], None);
        assert!(!service.requests.privileged);
    }

    #[test]
    fn interface_kinds_are_tagged_by_type() {
        let iface: NetworkInterface = serde_json::from_value(serde_json::json!({
            "service": "radio",
            "internal": "mon0",
            "type": "wifi-monitor",
            "external": "wlan1",
            "phy": "phy1"
        }))
        .unwrap();
        assert_eq!(
            iface.kind,
            InterfaceKind::WifiMonitor {
                external: "wlan1".into(),
                phy: "phy1".into()
            }
        );
    }
}
