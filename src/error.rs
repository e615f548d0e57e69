use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("network not found: {0}")]
    NetworkNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("chute has no service named {0}")]
    ServiceNotFound(String),
    #[error("container {0} is not running")]
    NotRunning(String),
    #[error("error pulling image {image}: {complete} / {layers} layers complete")]
    Pull {
        image: String,
        complete: usize,
        layers: usize,
    },
    #[error("error building image {0}")]
    Build(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("command `{command}` could not be launched: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {code}")]
    Command { command: String, code: i32 },
    #[error("`{command}` failed in namespace of {container}")]
    Netns { container: String, command: String },
    #[error("image workers are not running")]
    WorkersClosed,
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the not-found family, which removal paths treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ContainerNotFound(_) | Error::NetworkNotFound(_) | Error::ImageNotFound(_)
        )
    }
}
