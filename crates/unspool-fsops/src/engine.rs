//! Worker pool that runs extraction attempts behind a concurrency limit.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};
use unspool_core::{ExtractionEngine, ExtractionOutcome, ExtractionRequest, ExtractionUpdate};

use crate::error::FsOpsError;
use crate::pipeline::{self, ExtractionJob};

/// Extraction engine backed by the native decoders of this crate.
///
/// Every submission becomes a task that waits for a permit, reports
/// `Started`, runs the pipeline on the blocking pool and reports exactly one
/// `Finished`.
#[derive(Clone)]
pub struct FsOpsEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    waiting: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    stopping: AtomicBool,
    max_depth: u32,
}

impl FsOpsEngine {
    /// Engine running at most `parallel` extractions at once; nested
    /// archives are followed for at most `max_depth` passes.
    #[must_use]
    pub fn new(parallel: usize, max_depth: u32) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                permits: Arc::new(Semaphore::new(parallel.max(1))),
                tasks: Mutex::new(JoinSet::new()),
                waiting: Arc::new(AtomicUsize::new(0)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                stopping: AtomicBool::new(false),
                max_depth,
            }),
        }
    }

    /// Submissions accepted and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ExtractionEngine for FsOpsEngine {
    fn submit(&self, request: ExtractionRequest) -> anyhow::Result<usize> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(FsOpsError::Stopped.into());
        }
        let in_flight = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);

        let job = ExtractionJob {
            search_path: request.search_path,
            move_back: request.move_back,
            delete_originals: request.delete_originals,
            recursion: request.recursion,
            max_depth: self.inner.max_depth,
        };
        let name = request.name;
        let updates = request.updates;
        let permits = Arc::clone(&self.inner.permits);
        let waiting = Arc::clone(&self.inner.waiting);
        let in_flight_counter = Arc::clone(&self.inner.in_flight);

        let mut tasks = self.lock_tasks();
        while let Some(result) = tasks.try_join_next() {
            if let Err(err) = result {
                warn!(error = %err, "extraction task ended abnormally");
            }
        }
        tasks.spawn(async move {
            let permit = permits.acquire_owned().await;
            let queue_depth = waiting.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            let outcome = match permit {
                Ok(_permit) => {
                    if updates
                        .send(ExtractionUpdate::Started {
                            name: name.clone(),
                            queue_depth,
                        })
                        .await
                        .is_err()
                    {
                        debug!(name = %name, "extraction update receiver dropped");
                    }
                    task::spawn_blocking(move || pipeline::run(&job))
                        .await
                        .unwrap_or_else(|err| {
                            ExtractionOutcome::failed(format!("extraction worker failed: {err}"))
                        })
                }
                Err(_) => ExtractionOutcome::failed(FsOpsError::Stopped.describe()),
            };
            let outcome = ExtractionOutcome {
                queue_depth: waiting.load(Ordering::SeqCst),
                ..outcome
            };
            in_flight_counter.fetch_sub(1, Ordering::SeqCst);
            if updates
                .send(ExtractionUpdate::Finished { name, outcome })
                .await
                .is_err()
            {
                debug!("extraction update receiver dropped before completion");
            }
        });
        drop(tasks);

        Ok(in_flight)
    }

    async fn stop(&self, timeout: Duration) -> usize {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let mut tasks = mem::take(&mut *self.lock_tasks());
        if tasks.is_empty() {
            return 0;
        }
        info!(pending = tasks.len(), ?timeout, "draining extraction tasks");
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let abandoned = tasks.len();
        warn!(abandoned, "extraction drain timed out; aborting remaining tasks");
        tasks.abort_all();
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::write_zip_archive;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    type TestResult<T> = anyhow::Result<T>;

    fn request(
        name: &str,
        search_path: PathBuf,
        updates: &mpsc::Sender<ExtractionUpdate>,
    ) -> ExtractionRequest {
        ExtractionRequest {
            name: name.to_string(),
            search_path,
            move_back: false,
            delete_originals: false,
            recursion: true,
            updates: updates.clone(),
        }
    }

    #[tokio::test]
    async fn submission_reports_started_then_finished() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("Show");
        write_zip_archive(&dir.join("show.zip"), &[("episode.mkv", b"video")])?;

        let engine = FsOpsEngine::new(1, 3);
        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(engine.submit(request("Show", dir, &tx))?, 1);

        let started = rx.recv().await;
        assert!(matches!(
            started,
            Some(ExtractionUpdate::Started { ref name, queue_depth: 0 }) if name == "Show"
        ));
        let Some(ExtractionUpdate::Finished { name, outcome }) = rx.recv().await else {
            panic!("expected a finished update");
        };
        assert_eq!(name, "Show");
        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.new_files.len(), 1);
        assert_eq!(engine.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_reported_as_outcomes() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let engine = FsOpsEngine::new(2, 3);
        let (tx, mut rx) = mpsc::channel(8);
        engine.submit(request("Empty", temp.path().to_path_buf(), &tx))?;

        let mut finished = None;
        while let Some(update) = rx.recv().await {
            if let ExtractionUpdate::Finished { outcome, .. } = update {
                finished = Some(outcome);
                break;
            }
        }
        let outcome = finished.ok_or_else(|| anyhow::anyhow!("no finished update"))?;
        assert!(outcome.done);
        assert!(outcome.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn every_submission_finishes_exactly_once() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let engine = FsOpsEngine::new(1, 3);
        let (tx, mut rx) = mpsc::channel(16);
        for index in 0..3 {
            let dir = temp.path().join(format!("item{index}"));
            write_zip_archive(&dir.join("a.zip"), &[("a.txt", b"a")])?;
            engine.submit(request(&format!("item{index}"), dir, &tx))?;
        }
        drop(tx);

        let mut finished = Vec::new();
        let mut started = 0;
        while let Some(update) = rx.recv().await {
            match update {
                ExtractionUpdate::Started { .. } => started += 1,
                ExtractionUpdate::Finished { name, .. } => finished.push(name),
            }
        }
        finished.sort();
        assert_eq!(started, 3);
        assert_eq!(finished, vec!["item0", "item1", "item2"]);
        Ok(())
    }

    #[tokio::test]
    async fn stopped_engine_refuses_work() -> TestResult<()> {
        let engine = FsOpsEngine::new(1, 3);
        assert_eq!(engine.stop(Duration::from_millis(10)).await, 0);
        let (tx, _rx) = mpsc::channel(1);
        let err = engine
            .submit(request("late", PathBuf::from("/tmp"), &tx))
            .err()
            .ok_or_else(|| anyhow::anyhow!("submit should fail"))?;
        assert!(matches!(
            err.downcast_ref::<FsOpsError>(),
            Some(FsOpsError::Stopped)
        ));
        Ok(())
    }
}
