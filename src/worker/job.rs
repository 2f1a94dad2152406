use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::warn;

use crate::types::job::{ArtifactEntry, Job, JobAction, JobPatch};
use crate::types::task::ArtifactType;

/// The worker's view of its job: a local mirror of the record, a forwarding
/// channel to whatever binder carries updates out, and the single-slot
/// action mailbox.
pub struct WorkerJob {
    job: Mutex<Job>,
    updates: Mutex<Option<mpsc::UnboundedSender<JobPatch>>>,
    action: Mutex<Option<JobAction>>,
    action_notify: Notify,
}

impl WorkerJob {
    pub fn new(job: Job, updates: mpsc::UnboundedSender<JobPatch>) -> Arc<WorkerJob> {
        Arc::new(WorkerJob {
            job: Mutex::new(job),
            updates: Mutex::new(Some(updates)),
            action: Mutex::new(None),
            action_notify: Notify::new(),
        })
    }

    pub fn jid(&self) -> String {
        self.job.lock().unwrap().jid.clone()
    }

    pub fn media(&self) -> crate::types::job::Media {
        self.job.lock().unwrap().media.clone()
    }

    pub fn snapshot(&self) -> Job {
        self.job.lock().unwrap().clone()
    }

    /// Applies a patch to the local mirror and forwards the delta out.
    pub fn update(&self, patch: JobPatch) {
        self.job.lock().unwrap().apply(patch.clone());
        if let Some(updates) = &*self.updates.lock().unwrap() {
            let _ = updates.send(patch);
        }
    }

    /// Appends an artifact to the mirror and returns the index plus the
    /// grown list and tag map for forwarding.
    pub fn add_artifact(
        &self,
        artifact_type: ArtifactType,
        payload: String,
        tag: Option<&str>,
    ) -> (usize, Vec<ArtifactEntry>, HashMap<String, usize>) {
        let mut job = self.job.lock().unwrap();
        let aid = job.add_artifact(artifact_type, payload, tag);
        (aid, job.artifacts.clone(), job.artifact_tags.clone())
    }

    /// Posts a control action. Exactly one action is honored per job; any
    /// further request before it clears is dropped with a warning.
    pub fn post_action(&self, action: JobAction) {
        let mut slot = self.action.lock().unwrap();
        match *slot {
            Some(current) => {
                warn!(?current, ?action, "action already set, ignoring new action")
            }
            None => {
                *slot = Some(action);
                self.action_notify.notify_one();
            }
        }
    }

    pub fn action(&self) -> Option<JobAction> {
        *self.action.lock().unwrap()
    }

    /// Resolves when an action lands (or immediately if one already has).
    pub async fn action_changed(&self) {
        if self.action.lock().unwrap().is_some() {
            return;
        }
        self.action_notify.notified().await;
    }

    /// Final sweep and outcome report; drops the update channel so the
    /// binder can drain and say bye.
    pub fn finish(&self) -> crate::types::job::JobStatus {
        let outcome = {
            let mut job = self.job.lock().unwrap();
            for task in job.tasks.values_mut() {
                task.done();
            }
            job.outcome()
        };
        self.update(JobPatch {
            status: Some(outcome),
            is_process_exited: Some(true),
            ..Default::default()
        });
        self.updates.lock().unwrap().take();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::{JobRequest, JobStatus, JobType, Media};
    use crate::types::task::{TaskPatch, TaskStatus};

    fn worker_job() -> (Arc<WorkerJob>, mpsc::UnboundedReceiver<JobPatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = Job::new(JobRequest {
            job_type: JobType::Youtube,
            media: Media {
                source: "x".into(),
                metadata: Default::default(),
            },
        });
        (WorkerJob::new(job, tx), rx)
    }

    #[tokio::test]
    async fn test_update_mirrors_and_forwards() {
        let (job, mut rx) = worker_job();
        job.update(JobPatch::status(JobStatus::Running));
        assert_eq!(job.snapshot().status, JobStatus::Running);
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.status, Some(JobStatus::Running));
    }

    #[tokio::test]
    async fn test_single_action_slot() {
        let (job, _rx) = worker_job();
        job.post_action(JobAction::Stop);
        job.post_action(JobAction::Restart);
        assert_eq!(job.action(), Some(JobAction::Stop));
        // A set slot resolves immediately.
        job.action_changed().await;
    }

    #[tokio::test]
    async fn test_finish_sweeps_and_reports() {
        let (job, mut rx) = worker_job();
        job.update(JobPatch::task(
            "t-1",
            TaskPatch {
                name: Some("Transcription".into()),
                status: Some(TaskStatus::Running),
                ..Default::default()
            },
        ));
        let _ = rx.recv().await;

        let outcome = job.finish();
        // A task still running at exit counts as interrupted.
        assert_eq!(outcome, JobStatus::Interrupted);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.status, Some(JobStatus::Interrupted));
        assert_eq!(last.is_process_exited, Some(true));
        // Channel dropped afterwards.
        assert!(rx.recv().await.is_none());
    }
}
