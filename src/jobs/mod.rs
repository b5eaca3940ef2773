//! Persistent background job queue.
//!
//! Jobs live in the `ml_job` table and move through
//! `queued -> running -> succeeded | failed | canceled`. A crashed worker
//! leaves rows in `running`; they are swept to `failed` the next time a
//! manager starts. One worker thread drains the queue through registered
//! kind handlers.

pub mod batch;

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::db::jobs::JobRow;
use crate::db::CatalogDb;

pub use crate::db::jobs::{CheckpointRow, JobState};

type Handler = Box<dyn Fn(&JobRow) -> Result<()> + Send + Sync>;

/// Poll interval when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

pub struct JobManager {
    db: Arc<CatalogDb>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl JobManager {
    /// Create a manager and run zombie recovery immediately.
    pub fn new(db: Arc<CatalogDb>) -> Result<Self> {
        db.recover_zombie_jobs()?;
        Ok(Self {
            db,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Register the handler for a job kind. Replaces any previous handler.
    pub fn register_handler(
        &self,
        kind: &str,
        handler: impl Fn(&JobRow) -> Result<()> + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .insert(kind.to_string(), Box::new(handler));
    }

    pub fn enqueue(&self, kind: &str, payload: &Value, backend: Option<&str>) -> Result<i64> {
        self.db
            .enqueue_job(kind, &serde_json::to_string(payload)?, backend)
    }

    /// Run one queued job if any. Returns false when the queue is empty.
    pub fn run_next(&self) -> Result<bool> {
        let Some(job) = self.db.claim_next_job()? else {
            return Ok(false);
        };
        self.execute(&job);
        Ok(true)
    }

    /// Drain the queue synchronously. Returns how many jobs ran.
    pub fn run_pending(&self) -> Result<usize> {
        let mut count = 0;
        while self.run_next()? {
            count += 1;
        }
        Ok(count)
    }

    fn execute(&self, job: &JobRow) {
        tracing::info!(job_id = job.id, kind = job.kind, "Running job");
        let result = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&job.kind) {
                Some(handler) => handler(job),
                None => Err(anyhow::anyhow!("no handler registered for kind '{}'", job.kind)),
            }
        };

        let outcome = match &result {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        if let Err(e) = self.db.finish_job(job.id, outcome.as_deref()) {
            tracing::error!(job_id = job.id, error = %e, "Failed to record job outcome");
        }
        match result {
            Ok(()) => tracing::info!(job_id = job.id, "Job succeeded"),
            Err(e) => tracing::warn!(job_id = job.id, error = %e, "Job failed"),
        }
    }

    /// Start the background worker thread. The stop signal is honored
    /// between jobs, never mid-handler.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let db = self.db.clone();
        let handlers = self.handlers.clone();
        let stop = self.stop.clone();

        self.worker = Some(std::thread::spawn(move || {
            tracing::info!("Job worker started");
            while !stop.load(Ordering::SeqCst) {
                let claimed = match db.claim_next_job() {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::error!(error = %e, "Claiming next job failed");
                        std::thread::sleep(IDLE_SLEEP);
                        continue;
                    }
                };
                let Some(job) = claimed else {
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                };

                let result = {
                    let handlers = handlers.lock().unwrap();
                    match handlers.get(&job.kind) {
                        Some(handler) => handler(&job),
                        None => {
                            Err(anyhow::anyhow!("no handler registered for kind '{}'", job.kind))
                        }
                    }
                };
                let outcome = match &result {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                };
                if let Err(e) = db.finish_job(job.id, outcome.as_deref()) {
                    tracing::error!(job_id = job.id, error = %e, "Failed to record job outcome");
                }
            }
            tracing::info!("Job worker stopped");
        }));
    }

    /// Signal the worker to stop after the current job and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_pending_dispatches_by_kind() {
        let (_dir, db) = open_temp();
        let manager = JobManager::new(db.clone()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_clone = ran.clone();
        manager.register_handler("count", move |_job| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.register_handler("explode", |_job| anyhow::bail!("boom"));

        let ok = manager
            .enqueue("count", &serde_json::json!({"n": 1}), None)
            .unwrap();
        let bad = manager.enqueue("explode", &serde_json::json!({}), None).unwrap();
        let unknown = manager.enqueue("mystery", &serde_json::json!({}), None).unwrap();

        assert_eq!(manager.run_pending().unwrap(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        assert_eq!(db.job_by_id(ok).unwrap().unwrap().state, JobState::Succeeded);
        let failed = db.job_by_id(bad).unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(db.job_by_id(unknown).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn test_new_manager_sweeps_zombies() {
        let (_dir, db) = open_temp();
        db.enqueue_job("stuck", "{}", None).unwrap();
        let job = db.claim_next_job().unwrap().unwrap();

        // A new manager acts as a fresh process start.
        let _manager = JobManager::new(db.clone()).unwrap();
        let row = db.job_by_id(job.id).unwrap().unwrap();
        assert_eq!(row.state, JobState::Failed);
        assert_eq!(row.error.as_deref(), Some("zombie recovery"));
    }

    #[test]
    fn test_worker_thread_drains_queue() {
        let (_dir, db) = open_temp();
        let mut manager = JobManager::new(db.clone()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        manager.register_handler("tick", move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for _ in 0..3 {
            manager.enqueue("tick", &serde_json::json!({}), None).unwrap();
        }

        manager.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while ran.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        manager.stop();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }
}
