//! Bounded pool of tasks that run image pulls and builds.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::{acquire, ImageSource};
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::update::ProgressLog;

struct Job {
    source: ImageSource,
    progress: ProgressLog,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle for submitting image work.  Workers stop once every handle is
/// dropped.
#[derive(Clone)]
pub struct ImageWorkers {
    tx: mpsc::Sender<Job>,
}

impl ImageWorkers {
    /// Spawns `workers` tasks (at least one) on the current tokio runtime.
    pub fn spawn(runtime: Arc<dyn ContainerRuntime>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 4);
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..workers {
            let rx = Arc::clone(&rx);
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };

                    debug!("image worker {}: {}", id, job.source);
                    let outcome = acquire(runtime.as_ref(), job.source, &job.progress).await;
                    if job.reply.send(outcome).is_err() {
                        warn!("image worker {}: caller went away before the result", id);
                    }
                }
                debug!("image worker {} exiting", id);
            });
        }

        Self { tx }
    }

    /// Queues `source` and waits for its outcome.
    pub async fn submit(&self, source: ImageSource, progress: ProgressLog) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Job {
                source,
                progress,
                reply,
            })
            .await
            .map_err(|_| Error::WorkersClosed)?;
        outcome.await.map_err(|_| Error::WorkersClosed)?
    }
}

impl std::fmt::Debug for ImageWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageWorkers")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
