use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::normalize::{RenderJob, RenderResult};

/// Runs tile renders on tokio's blocking pool.
///
/// A job is moved in whole and its input buffer comes back inside the
/// [`RenderResult`], so the worker never keeps a reference to layer data.
/// At most `max_jobs` renders run at once.
#[derive(Debug, Clone)]
pub struct NormalizeWorker {
    permits: Arc<Semaphore>,
}

impl NormalizeWorker {
    pub fn new(max_jobs: usize) -> Self {
        assert!(max_jobs > 0, "max_jobs must be > 0");
        Self {
            permits: Arc::new(Semaphore::new(max_jobs)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run(&self, job: RenderJob) -> Result<RenderResult> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| Error::Worker(err.to_string()))?;

        let index = job.index;
        tracing::trace!(tile = index, pixels = job.pixel_count(), "render dispatched");
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|err| Error::Worker(format!("tile {index}: {err}")))?
    }
}
