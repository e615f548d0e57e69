//! Dockerfile synthesis for light services.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{CommandSpec, Service};

const APP_DIR: &str = "/opt/paradrop/app";

const BASE_IMAGES: &[(&str, &str)] = &[
    ("go", "golang:1.8"),
    ("gradle", "gradle:4.2"),
    ("maven", "maven:3.5"),
    ("node", "node:8"),
    ("python2", "python:2"),
    ("python3", "python:3"),
];

static PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._+-]*$").expect("package pattern is valid"));

/// Generates a Dockerfile from a light service's base shorthand, packages
/// and command.
pub struct Dockerfile<'a> {
    service: &'a Service,
}

impl<'a> Dockerfile<'a> {
    pub fn new(service: &'a Service) -> Self {
        Self { service }
    }

    fn base(&self) -> Option<&'static str> {
        let shorthand = self.service.image.as_deref()?;
        BASE_IMAGES
            .iter()
            .find(|(name, _)| *name == shorthand)
            .map(|(_, image)| *image)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base().is_none() {
            return Err(Error::InvalidConfig(format!(
                "unsupported base image {:?}",
                self.service.image.as_deref().unwrap_or_default()
            )));
        }

        match &self.service.command {
            None => return Err(Error::InvalidConfig("command is required".into())),
            Some(CommandSpec::Shell(cmd)) if cmd.trim().is_empty() => {
                return Err(Error::InvalidConfig("command is empty".into()))
            }
            Some(CommandSpec::Exec(parts)) if parts.is_empty() => {
                return Err(Error::InvalidConfig("command is empty".into()))
            }
            Some(_) => {}
        }

        if let Some(bad) = self
            .service
            .build
            .packages
            .iter()
            .find(|pkg| !PACKAGE.is_match(pkg))
        {
            return Err(Error::InvalidConfig(format!("invalid package name {:?}", bad)));
        }
        Ok(())
    }

    pub fn render(&self) -> Result<String> {
        self.validate()?;
        let shorthand = self.service.image.as_deref().unwrap_or_default();
        let mut out = String::new();

        let _ = writeln!(out, "FROM {}", self.base().unwrap_or_default());
        let packages = &self.service.build.packages;
        if !packages.is_empty() {
            let _ = writeln!(
                out,
                "RUN apt-get update && apt-get install -y {} && rm -rf /var/lib/apt/lists/*",
                packages.join(" ")
            );
        }
        let _ = writeln!(out, "WORKDIR {}", APP_DIR);
        let _ = writeln!(out, "COPY . {}", APP_DIR);

        match shorthand {
            "node" => {
                let _ = writeln!(out, "RUN if [ -f package.json ]; then npm install; fi");
            }
            "python2" | "python3" => {
                let _ = writeln!(
                    out,
                    "RUN if [ -f requirements.txt ]; then pip install -r requirements.txt; fi"
                );
            }
            _ => {}
        }

        match &self.service.command {
            Some(CommandSpec::Shell(cmd)) => {
                let _ = writeln!(out, "CMD {}", cmd);
            }
            Some(CommandSpec::Exec(parts)) => {
                let json = serde_json::to_string(parts).map_err(|e| Error::InvalidConfig(e.to_string()))?;
                let _ = writeln!(out, "CMD {}", json);
            }
            None => {}
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuildSpec, ServiceType};

    fn light(image: &str, command: Option<CommandSpec>, packages: &[&str]) -> Service {
        Service {
            name: Some("api".into()),
            kind: ServiceType::Light,
            image: Some(image.into()),
            command,
            build: BuildSpec {
                packages: packages.iter().map(|p| p.to_string()).collect(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn renders_python_service() {
        let service = light(
            "python3",
            Some(CommandSpec::Exec(vec!["python".into(), "main.py".into()])),
            &["curl"],
        );
        let rendered = Dockerfile::new(&service).render().unwrap();
        assert_eq!(
            rendered,
            "FROM python:3\n\
             RUN apt-get update && apt-get install -y curl && rm -rf /var/lib/apt/lists/*\n\
             WORKDIR /opt/paradrop/app\n\
             COPY . /opt/paradrop/app\n\
             RUN if [ -f requirements.txt ]; then pip install -r requirements.txt; fi\n\
             CMD [\"python\",\"main.py\"]\n"
        );
    }

    #[test]
    fn renders_shell_command_for_node() {
        let service = light("node", Some(CommandSpec::Shell("node index.js".into())), &[]);
        let rendered = Dockerfile::new(&service).render().unwrap();
        assert!(rendered.starts_with("FROM node:8\n"));
        assert!(rendered.contains("npm install"));
        assert!(rendered.ends_with("CMD node index.js\n"));
    }

    #[test]
    fn rejects_unknown_base() {
        let service = light("cobol", Some(CommandSpec::Shell("run".into())), &[]);
        assert!(matches!(
            Dockerfile::new(&service).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_missing_command() {
        let service = light("go", None, &[]);
        assert!(Dockerfile::new(&service).render().is_err());
    }

    #[test]
    fn rejects_shell_metacharacters_in_packages() {
        let service = light("python2", Some(CommandSpec::Shell("python".into())), &["vim; rm -rf /"]);
        assert!(Dockerfile::new(&service).validate().is_err());
    }
}
