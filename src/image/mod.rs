//! Image acquisition: pulling from a registry or building locally.
//!
//! Pulls and builds are the slowest part of a deployment, so the work is
//! handed to [`ImageWorkers`] and the calling stage waits for the outcome.
//! Progress from the engine is filtered before it reaches the update's
//! progress log; layer download redraws and bare layer ids are dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{info, warn};
use regex::Regex;

use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::runtime::{BuildRequest, ContainerRuntime, ProgressRecord};
use crate::types::{Service, ServiceType};
use crate::update::{ProgressLog, Update};

pub mod dockerfile;
pub mod workers;

pub use dockerfile::Dockerfile;
pub use workers::ImageWorkers;

// Example lines:
// Extracting
// 862a3e9af0ae
// [================================================>  ] 64.06 MB/65.7 MB
static NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Downloading|Extracting|[a-z0-9]+|\[=*>?\s*\].*)$").expect("noise pattern is valid")
});

/// True for progress redraws that should not reach the progress log.
pub fn is_noisy(line: &str) -> bool {
    NOISE.is_match(line)
}

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Pull { image: String },
    Build { tag: String, context: BuildContext, pull: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildContext {
    /// A lone Dockerfile held in memory.
    Inline(String),
    /// A directory archived as the build context.  A generated Dockerfile,
    /// when present, is written into it first.
    Directory {
        path: PathBuf,
        dockerfile: Option<String>,
    },
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Pull { image } => write!(f, "pull {}", image),
            ImageSource::Build { tag, .. } => write!(f, "build {}", tag),
        }
    }
}

/// Works out how to obtain the image for `service`.  Light services are
/// validated here so a bad service fails before any work is queued.
pub fn image_source(update: &Update, service: &Service) -> Result<ImageSource> {
    let image = service.image_name(update.chute_of(service));
    let source = match service.kind {
        ServiceType::Image => ImageSource::Pull { image },
        ServiceType::Inline => {
            let dockerfile = service.dockerfile.clone().ok_or_else(|| {
                Error::InvalidConfig(format!("inline service {} has no dockerfile", image))
            })?;
            ImageSource::Build {
                tag: image,
                context: BuildContext::Inline(dockerfile),
                pull: false,
            }
        }
        ServiceType::Light => ImageSource::Build {
            tag: image,
            context: BuildContext::Directory {
                path: update.workdir.clone(),
                dockerfile: Some(Dockerfile::new(service).render()?),
            },
            pull: true,
        },
        ServiceType::Normal => ImageSource::Build {
            tag: image,
            context: BuildContext::Directory {
                path: update.workdir.clone(),
                dockerfile: None,
            },
            pull: false,
        },
    };
    Ok(source)
}

/// Obtains the image `service` runs, waiting for an image worker to finish.
pub async fn prepare_image(ctx: &AgentContext, update: &Update, service: &Service) -> Result<()> {
    let source = image_source(update, service)?;
    ctx.images.submit(source, update.progress.clone()).await
}

/// Fails when the image for `service` is not present locally.
pub async fn check_image(ctx: &AgentContext, update: &Update, service: &Service) -> Result<()> {
    let image = service.image_name(update.chute_of(service));
    ctx.runtime.inspect_image(&image).await
}

/// Removes the image for `service`; failures are only logged.
pub async fn remove_image(ctx: &AgentContext, update: &Update, service: &Service) {
    let image = service.image_name(update.chute_of(service));
    info!("Removing image {}", image);
    if let Err(err) = ctx.runtime.remove_image(&image).await {
        warn!("Error removing image: {}", err);
    }
}

/// Runs one pull or build to completion.  This is what image workers run.
pub async fn acquire(runtime: &dyn ContainerRuntime, source: ImageSource, progress: &ProgressLog) -> Result<()> {
    match source {
        ImageSource::Pull { image } => {
            progress.push(format!("Pulling image: {}", image));
            let mut tracker = PullTracker::default();
            runtime
                .pull_image(&image, &mut |record: ProgressRecord| tracker.observe(&record, progress))
                .await?;
            tracker.finish(&image, progress)
        }
        ImageSource::Build { tag, context, pull } => {
            let context = build_context(context).await?;
            let mut tracker = BuildTracker::default();
            let request = BuildRequest {
                tag: tag.clone(),
                context,
                pull,
            };
            runtime
                .build_image(request, &mut |record: ProgressRecord| tracker.observe(&record, progress))
                .await?;
            tracker.finish(&tag)
        }
    }
}

/// Counts layers announced and completed during a pull.
#[derive(Debug, Default)]
pub struct PullTracker {
    layers: usize,
    complete: usize,
    error: Option<String>,
}

impl PullTracker {
    pub fn observe(&mut self, record: &ProgressRecord, progress: &ProgressLog) {
        if let Some(error) = &record.error {
            progress.push(error.trim_end().to_string());
            self.error = Some(error.clone());
        }

        // Records with progress detail are the moving progress bars.
        if record.has_progress_detail {
            return;
        }
        let (Some(status), Some(id)) = (&record.status, &record.id) else {
            return;
        };

        progress.push(format!("{}: {}", status, id));
        match status.trim().to_lowercase().as_str() {
            "pulling fs layer" => self.layers += 1,
            "pull complete" => self.complete += 1,
            _ => {}
        }
    }

    pub fn finish(self, image: &str, progress: &ProgressLog) -> Result<()> {
        progress.push(format!(
            "Finished pulling {} / {} layers",
            self.complete, self.layers
        ));
        if self.complete < self.layers || self.error.is_some() {
            return Err(Error::Pull {
                image: image.to_string(),
                complete: self.complete,
                layers: self.layers,
            });
        }
        Ok(())
    }
}

/// Watches a build stream for error records.
#[derive(Debug, Default)]
pub struct BuildTracker {
    failed: bool,
}

impl BuildTracker {
    pub fn observe(&mut self, record: &ProgressRecord, progress: &ProgressLog) {
        if record.error_detail.is_some() {
            self.failed = true;
        }
        for message in record.messages() {
            let message = message.trim_end();
            if !message.is_empty() && !is_noisy(message) {
                progress.push(message.to_string());
            }
        }
    }

    pub fn finish(self, tag: &str) -> Result<()> {
        if self.failed {
            return Err(Error::Build(tag.to_string()));
        }
        Ok(())
    }
}

async fn build_context(context: BuildContext) -> Result<Vec<u8>> {
    match context {
        BuildContext::Inline(dockerfile) => dockerfile_archive(&dockerfile),
        BuildContext::Directory { path, dockerfile } => {
            if let Some(contents) = dockerfile {
                tokio::fs::write(path.join("Dockerfile"), contents).await?;
            }
            tokio::task::spawn_blocking(move || directory_archive(&path))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?
        }
    }
}

fn dockerfile_archive(dockerfile: &str) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    Ok(builder.into_inner()?)
}

fn directory_archive(path: &Path) -> Result<Vec<u8>> {
    if !path.join("Dockerfile").is_file() {
        return Err(Error::InvalidConfig(format!(
            "{} does not contain a Dockerfile",
            path.display()
        )));
    }
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", path)?;
    Ok(builder.into_inner()?)
}
