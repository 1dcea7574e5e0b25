use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// Runs subscription handlers and live command processors off the dispatch
/// path. With a positive thread count at most that many jobs run at once.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Option<Arc<Semaphore>>,
}

impl WorkerPool {
    /// `threads == 0` leaves concurrency to tokio's blocking pool.
    pub fn new(threads: usize) -> Self {
        Self {
            permits: (threads > 0).then(|| Arc::new(Semaphore::new(threads))),
        }
    }

    /// Must run inside a tokio runtime.
    pub fn submit<F>(&self, job_name: &'static str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = self.permits.clone();
        let _ = tokio::spawn(async move {
            let _permit = match permits {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            if let Err(error) = tokio::task::spawn_blocking(job).await {
                warn!(job = job_name, %error, "worker job failed");
            }
        });
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(0)
    }
}
