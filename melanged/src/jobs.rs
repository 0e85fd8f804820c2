//! Typed jobs with lifecycle, progress, cooperative cancellation, and
//! durable status.
//!
//! The in-memory map is authoritative for the current process; when a
//! durable record store is configured every status change is mirrored
//! there fire-and-forget, and on restart stale `in_progress` rows are
//! marked failed. The manager is a coordinator, not a worker: each job
//! runs on its own tokio task and observes cancellation at explicit
//! checkpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::types::{JobRecord, JobStatus, Uid};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::EventBus;
use crate::session::record::RecordStore;

/// Cooperative cancellation token handed to every worker.
///
/// Workers call [`CancelToken::check`] at phase boundaries and around
/// every suspension point; cancellation is never instant.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> HubResult<()> {
        if self.is_cancelled() {
            Err(HubError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Handle a worker uses to report progress and observe cancellation.
#[derive(Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub cancel: CancelToken,
    manager: Arc<JobManager>,
}

impl JobHandle {
    /// Report progress for the current phase. Updates are coalesced and
    /// can never move progress backward.
    pub fn set_progress(&self, phase: &str, percent: u8) {
        self.manager.set_progress(&self.job_id, phase, percent);
    }

    pub fn check_cancelled(&self) -> HubResult<()> {
        self.cancel.check()
    }
}

/// Job coordinator: allocation, dispatch, status polling, cancellation,
/// and terminal-state cleanup.
pub struct JobManager {
    jobs: RwLock<HashMap<String, JobRecord>>,
    cancel_handles: Mutex<HashMap<String, watch::Sender<bool>>>,
    events: EventBus,
    durable: Option<Arc<dyn RecordStore>>,
    restart_abort_timeout: Duration,
}

impl JobManager {
    pub fn new(
        events: EventBus,
        durable: Option<Arc<dyn RecordStore>>,
        restart_abort_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            cancel_handles: Mutex::new(HashMap::new()),
            events,
            durable,
            restart_abort_timeout,
        })
    }

    /// Recover mirrored jobs after a restart. `in_progress` rows whose
    /// `updated_at` is older than the abort timeout belonged to a dead
    /// worker process and are marked failed.
    pub async fn recover(&self) {
        let Some(durable) = &self.durable else {
            return;
        };
        let rows = match durable.list(10_000, 0).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("job recovery skipped, durable store unavailable: {err}");
                return;
            }
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.restart_abort_timeout).unwrap_or_default();
        let mut recovered = 0;
        let mut aborted = 0;
        for row in rows {
            let Ok(mut job) = serde_json::from_value::<JobRecord>(row) else {
                continue;
            };
            if job.status.is_active() {
                // The worker that owned this row died with the previous
                // process; there are no exactly-once guarantees across
                // restarts, so it fails rather than being adopted.
                let message = if job.updated_at < cutoff {
                    "job aborted by daemon restart"
                } else {
                    "in-flight job lost across restart"
                };
                job.status = JobStatus::Failed;
                job.error = Some(HubError::new(ErrorCode::JobTimeout, message));
                job.updated_at = Utc::now();
                self.mirror(&job);
                aborted += 1;
            }
            recovered += 1;
            self.jobs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(job.job_id.clone(), job);
        }
        if recovered > 0 {
            info!("recovered {recovered} mirrored jobs ({aborted} restart-aborted)");
        }
    }

    /// Submit a job. Enforces at-most-one active job per target UID: an
    /// existing active job for the same UID is cancelled and its registry
    /// slot replaced before the new job starts.
    pub fn submit<F, Fut>(
        self: &Arc<Self>,
        job_type: &str,
        session_id: Option<String>,
        target_uid: Option<Uid>,
        params: Value,
        worker: F,
    ) -> HubResult<JobRecord>
    where
        F: FnOnce(JobHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = HubResult<Value>> + Send + 'static,
    {
        if let Some(uid) = &target_uid {
            if let Some(existing) = self.active_job_for_target(uid) {
                info!(
                    "cancelling existing active job {} for target {uid}",
                    existing.job_id
                );
                self.cancel(&existing.job_id);
            }
        }

        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            job_type: job_type.to_string(),
            session_id,
            target_uid,
            status: JobStatus::Pending,
            progress: 0,
            phase: None,
            params,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let (tx, rx) = watch::channel(false);
        self.cancel_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), tx);
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), record.clone());
        self.mirror(&record);
        self.events.emit(
            "job_submitted",
            &serde_json::json!({"job_id": job_id, "job_type": job_type}),
        );

        let handle = JobHandle {
            job_id: job_id.clone(),
            cancel: CancelToken { rx },
            manager: Arc::clone(self),
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.transition(&handle.job_id, JobStatus::InProgress, None, None);
            let job_id = handle.job_id.clone();
            match worker(handle).await {
                Ok(result) => {
                    manager.transition(&job_id, JobStatus::Completed, Some(result), None)
                }
                Err(err) if err.error_code == ErrorCode::JobCancelled => {
                    manager.transition(&job_id, JobStatus::Cancelled, None, Some(err))
                }
                Err(err) => {
                    warn!("job {job_id} failed: {err}");
                    manager.transition(&job_id, JobStatus::Failed, None, Some(err))
                }
            }
            manager.drop_cancel_handle(&job_id);
        });

        debug!("submitted job {job_id} ({job_type})");
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Latest job (active preferred, else most recent) for a target UID.
    pub fn get_by_target(&self, uid: &Uid) -> Option<JobRecord> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<&JobRecord> = jobs
            .values()
            .filter(|j| j.target_uid.as_ref() == Some(uid))
            .collect();
        candidates.sort_by_key(|j| j.created_at);
        candidates
            .iter()
            .rev()
            .find(|j| j.status.is_active())
            .or_else(|| candidates.last())
            .map(|j| (*j).clone())
    }

    fn active_job_for_target(&self, uid: &Uid) -> Option<JobRecord> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.values()
            .find(|j| j.target_uid.as_ref() == Some(uid) && j.status.is_active())
            .cloned()
    }

    /// Request cancellation. The record transitions immediately; the
    /// worker observes the flag at its next checkpoint and cleans up.
    pub fn cancel(&self, job_id: &str) -> bool {
        let signalled = {
            let handles = self
                .cancel_handles
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            handles.get(job_id).map(|tx| tx.send(true).is_ok())
        };
        if signalled.is_none() {
            return false;
        }
        self.transition(
            job_id,
            JobStatus::Cancelled,
            None,
            Some(HubError::cancelled()),
        );
        true
    }

    /// Cancel the active job targeting `uid`, if any.
    pub fn cancel_by_target(&self, uid: &Uid) -> Option<JobRecord> {
        let job = self.active_job_for_target(uid)?;
        self.cancel(&job.job_id);
        self.get(&job.job_id)
    }

    /// Discard terminal jobs older than `max_age` from the cache and the
    /// durable mirror. Returns how many were removed.
    pub async fn cleanup_terminal(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let removed: Vec<String> = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = jobs
                .values()
                .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
                .map(|j| j.job_id.clone())
                .collect();
            for id in &stale {
                jobs.remove(id);
            }
            stale
        };
        if let Some(durable) = &self.durable {
            for id in &removed {
                if let Err(err) = durable.remove(id).await {
                    debug!("durable cleanup of {id} failed: {err}");
                }
            }
        }
        if !removed.is_empty() {
            info!("cleaned up {} terminal jobs", removed.len());
        }
        removed.len()
    }

    fn set_progress(&self, job_id: &str, phase: &str, percent: u8) {
        let updated = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }
            // Coalesced and monotone: never let progress move backward.
            let percent = percent.min(100).max(job.progress);
            if percent == job.progress && job.phase.as_deref() == Some(phase) {
                return;
            }
            job.progress = percent;
            job.phase = Some(phase.to_string());
            job.updated_at = Utc::now();
            job.clone()
        };
        self.events.emit(
            "job_progress",
            &serde_json::json!({
                "job_id": job_id,
                "phase": phase,
                "progress": updated.progress,
            }),
        );
        self.mirror(&updated);
    }

    /// Apply a lifecycle transition, enforcing terminal-state immutability.
    fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<HubError>,
    ) {
        let updated = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.status.is_terminal() {
                // A cancelled job's worker may still try to report
                // completion or failure; terminal states win.
                return;
            }
            job.status = status;
            job.updated_at = Utc::now();
            match status {
                JobStatus::Completed => {
                    job.progress = 100;
                    job.result = result;
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    job.error = error;
                }
                _ => {}
            }
            job.clone()
        };
        self.events.emit(
            "job_status",
            &serde_json::json!({"job_id": job_id, "status": status.to_string()}),
        );
        self.mirror(&updated);
    }

    fn drop_cancel_handle(&self, job_id: &str) {
        self.cancel_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    /// Fire-and-forget persistence of a status change.
    fn mirror(&self, job: &JobRecord) {
        let Some(durable) = &self.durable else {
            return;
        };
        let durable = Arc::clone(durable);
        let job = job.clone();
        tokio::spawn(async move {
            let document = match serde_json::to_value(&job) {
                Ok(document) => document,
                Err(err) => {
                    warn!("failed to serialize job {} for mirror: {err}", job.job_id);
                    return;
                }
            };
            if let Err(err) = durable.upsert(&job.job_id, &document).await {
                warn!("failed to mirror job {}: {err}", job.job_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use melange_common::types::UidKind;

    fn manager() -> Arc<JobManager> {
        JobManager::new(EventBus::default(), None, Duration::from_secs(300))
    }

    async fn wait_for<F: Fn(&JobRecord) -> bool>(
        manager: &JobManager,
        job_id: &str,
        predicate: F,
    ) -> JobRecord {
        for _ in 0..200 {
            if let Some(job) = manager.get(job_id) {
                if predicate(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached for job {job_id}");
    }

    #[tokio::test]
    async fn lifecycle_pending_to_completed() {
        let manager = manager();
        let record = manager
            .submit("demo", None, None, serde_json::json!({}), |handle| async move {
                handle.set_progress("working", 50);
                Ok(serde_json::json!({"answer": 42}))
            })
            .unwrap();
        assert_eq!(record.status, JobStatus::Pending);

        let done = wait_for(&manager, &record.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result.unwrap()["answer"], 42);
    }

    #[tokio::test]
    async fn failures_carry_the_typed_error() {
        let manager = manager();
        let record = manager
            .submit("demo", None, None, serde_json::json!({}), |_| async move {
                Err(HubError::new(ErrorCode::DownloadFailed, "mirror down"))
            })
            .unwrap();
        let done = wait_for(&manager, &record.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.unwrap().error_code, ErrorCode::DownloadFailed);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let manager = manager();
        let record = manager
            .submit("demo", None, None, serde_json::json!({}), |handle| async move {
                handle.set_progress("a", 60);
                handle.set_progress("b", 30);
                let snapshot = handle.manager.get(&handle.job_id).unwrap();
                Ok(serde_json::json!({"observed": snapshot.progress}))
            })
            .unwrap();
        let done = wait_for(&manager, &record.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(done.result.unwrap()["observed"], 60);
    }

    #[tokio::test]
    async fn second_submit_for_same_target_cancels_the_first() {
        let manager = manager();
        let uid = Uid::new(UidKind::Object, 1);

        let first = manager
            .submit(
                "download",
                None,
                Some(uid.clone()),
                serde_json::json!({}),
                |handle| async move {
                    // Spin at a checkpoint until cancellation arrives.
                    for _ in 0..1000 {
                        if handle.cancel.is_cancelled() {
                            return Err(HubError::cancelled());
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(serde_json::json!({}))
                },
            )
            .unwrap();

        wait_for(&manager, &first.job_id, |j| j.status == JobStatus::InProgress).await;

        let second = manager
            .submit(
                "download",
                None,
                Some(uid.clone()),
                serde_json::json!({}),
                |_| async move { Ok(serde_json::json!({})) },
            )
            .unwrap();

        let first_done = wait_for(&manager, &first.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(first_done.status, JobStatus::Cancelled);

        let second_done = wait_for(&manager, &second.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(second_done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let manager = manager();
        let record = manager
            .submit("demo", None, None, serde_json::json!({}), |handle| async move {
                // Worker keeps running past cancellation and tries to
                // complete; the cancelled state must win.
                while !handle.cancel.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(serde_json::json!({"late": true}))
            })
            .unwrap();

        wait_for(&manager, &record.job_id, |j| j.status == JobStatus::InProgress).await;
        assert!(manager.cancel(&record.job_id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = manager.get(&record.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let manager = manager();
        assert!(!manager.cancel("nope"));
    }

    #[tokio::test]
    async fn cleanup_discards_old_terminal_jobs_only() {
        let manager = manager();
        let record = manager
            .submit("demo", None, None, serde_json::json!({}), |_| async move {
                Ok(serde_json::json!({}))
            })
            .unwrap();
        wait_for(&manager, &record.job_id, |j| j.status.is_terminal()).await;

        // Too young to sweep.
        assert_eq!(manager.cleanup_terminal(Duration::from_secs(3600)).await, 0);
        // Old enough.
        assert_eq!(manager.cleanup_terminal(Duration::from_secs(0)).await, 1);
        assert!(manager.get(&record.job_id).is_none());
    }

    #[tokio::test]
    async fn status_lookup_by_target_uid() {
        let manager = manager();
        let uid = Uid::new(UidKind::Object, 9);
        let record = manager
            .submit(
                "download",
                None,
                Some(uid.clone()),
                serde_json::json!({}),
                |_| async move { Ok(serde_json::json!({})) },
            )
            .unwrap();
        wait_for(&manager, &record.job_id, |j| j.status.is_terminal()).await;
        let by_target = manager.get_by_target(&uid).unwrap();
        assert_eq!(by_target.job_id, record.job_id);
    }
}
