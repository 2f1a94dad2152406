use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::task::{ArtifactType, TaskPatch, TaskState};
use crate::now_ts;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Youtube,
    Local,
}

/// Lifecycle of a job as owned by the master.
///
/// ```text
/// PENDING → QUEUED → CREATED → RUNNING → COMPLETED | FAILED | INTERRUPTED
///                                      ↘ INTERRUPTING → INTERRUPTED
///                       (any)     → CANCELED (before CREATED)
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Created,
    Running,
    Interrupting,
    Interrupted,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal states are one-way: no resurrection.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Interrupted
                | JobStatus::Canceled
        )
    }
}

/// Actions a user may post against a running job. Only `Stop` is honored by
/// the pipeline; the rest are accepted on the wire and warned about.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Start,
    Pause,
    Stop,
    Restart,
    Delete,
}

/// The media source of a job plus whatever metadata the pipeline learns
/// about it along the way.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Media {
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Media {
    /// Applies a partial update; metadata is merged key-wise.
    pub fn apply(&mut self, patch: MediaPatch) {
        if let Some(source) = patch.source {
            self.source = source;
        }
        if let Some(metadata) = patch.metadata {
            for (key, value) in metadata {
                self.metadata.insert(key, value);
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

/// One produced output: type plus payload. For video/audio the payload is a
/// path relative to the media path, otherwise inline JSON or text.
/// Serialized as a two-element array, which is also the dump format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry(pub ArtifactType, pub String);

/// The user-submitted body of `{role:user, action:submit}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: JobType,
    pub media: Media,
}

/// Authoritative record of one production request.
///
/// The wire serialization omits `artifacts` (they are fetched by index via
/// the artifact action); [`JobDump`] adds them for the on-disk form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub finished_at: Option<f64>,
    pub job_type: JobType,
    pub media: Media,
    pub status: JobStatus,
    pub message: String,
    #[serde(rename = "isProcessExited")]
    pub is_process_exited: bool,
    pub last_update: f64,
    pub tasks: HashMap<String, TaskState>,
    pub artifact_tags: HashMap<String, usize>,
    #[serde(default, skip_serializing)]
    pub artifacts: Vec<ArtifactEntry>,
}

/// Full dump form of a job: the wire fields plus the artifact list.
#[derive(Serialize)]
pub struct JobDump<'a> {
    #[serde(flatten)]
    job: &'a Job,
    artifacts: &'a [ArtifactEntry],
}

/// Partial update to a job. `media` and `tasks` patch named fields only;
/// the artifact list and tag map are replace-with-growth; the rest assign.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "isProcessExited", skip_serializing_if = "Option::is_none")]
    pub is_process_exited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<HashMap<String, TaskPatch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<ArtifactEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_tags: Option<HashMap<String, usize>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> JobPatch {
        JobPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn task(tid: &str, patch: TaskPatch) -> JobPatch {
        JobPatch {
            tasks: Some(HashMap::from([(tid.to_owned(), patch)])),
            ..Default::default()
        }
    }
}

impl Job {
    pub fn new(request: JobRequest) -> Job {
        let now = now_ts();
        Job {
            jid: Uuid::new_v4().to_string(),
            created_at: now,
            started_at: None,
            finished_at: None,
            job_type: request.job_type,
            media: request.media,
            status: JobStatus::Pending,
            message: "Waiting for scheduler...".into(),
            is_process_exited: false,
            last_update: now,
            tasks: HashMap::new(),
            artifact_tags: HashMap::new(),
            artifacts: Vec::new(),
        }
    }

    /// Merges a partial update and bumps `last_update`.
    pub fn apply(&mut self, patch: JobPatch) {
        self.last_update = now_ts();
        if let Some(status) = patch.status {
            if self.accepts(status) {
                self.status = status;
            }
        }
        if let Some(message) = patch.message {
            self.message = message;
        }
        if let Some(exited) = patch.is_process_exited {
            self.is_process_exited = exited;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            self.finished_at = Some(finished_at);
        }
        if let Some(media) = patch.media {
            self.media.apply(media);
        }
        if let Some(tasks) = patch.tasks {
            for (tid, task_patch) in tasks {
                match self.tasks.get_mut(&tid) {
                    Some(task) => task.apply(task_patch),
                    None => {
                        self.tasks
                            .insert(tid.clone(), TaskState::from_patch(tid, task_patch));
                    }
                }
            }
        }
        if let Some(artifacts) = patch.artifacts {
            // Append-only: a shorter list is a stale frame.
            if artifacts.len() >= self.artifacts.len() {
                self.artifacts = artifacts;
            }
        }
        if let Some(tags) = patch.artifact_tags {
            for (tag, aid) in tags {
                self.artifact_tags.insert(tag, aid);
            }
        }
    }

    fn accepts(&self, next: JobStatus) -> bool {
        if self.status.is_terminal() {
            return next == self.status;
        }
        if self.status == JobStatus::Interrupting {
            return matches!(next, JobStatus::Interrupted | JobStatus::Interrupting);
        }
        true
    }

    /// Appends an artifact, optionally tagging it, and returns its index.
    pub fn add_artifact(
        &mut self,
        artifact_type: ArtifactType,
        payload: String,
        tag: Option<&str>,
    ) -> usize {
        self.artifacts.push(ArtifactEntry(artifact_type, payload));
        let aid = self.artifacts.len() - 1;
        if let Some(tag) = tag {
            self.artifact_tags.insert(tag.to_owned(), aid);
        }
        aid
    }

    pub fn get_artifact(&self, index: usize) -> Option<&ArtifactEntry> {
        self.artifacts.get(index)
    }

    /// Computes the job outcome from its tasks: interrupted beats failed
    /// beats completed.
    pub fn outcome(&self) -> JobStatus {
        let mut result = JobStatus::Completed;
        for task in self.tasks.values() {
            if task.status == super::task::TaskStatus::Interrupted {
                return JobStatus::Interrupted;
            }
            if !task.status.is_success() {
                result = JobStatus::Failed;
            }
        }
        result
    }

    /// Finalizes the record once the worker process has exited: sweeps the
    /// tasks, fails the job on an abnormal exit, and stamps `finished_at`.
    pub fn done(&mut self) {
        for task in self.tasks.values_mut() {
            task.done();
        }
        if !self.is_process_exited {
            self.status = JobStatus::Failed;
            self.is_process_exited = true;
        }
        self.finished_at = Some(now_ts());
        self.last_update = self.finished_at.unwrap();
    }

    /// Atomically writes the dump form to `<media_path>/<jid>.json`.
    pub fn dump(&self, media_path: &Path) -> std::io::Result<()> {
        let dump = JobDump {
            job: self,
            artifacts: &self.artifacts,
        };
        let body = serde_json::to_vec(&dump)?;
        let tmp = media_path.join(format!(".{}.json.tmp", self.jid));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, media_path.join(format!("{}.json", self.jid)))
    }

    pub fn load(path: &Path) -> anyhow::Result<Job> {
        let body = std::fs::read(path)?;
        Ok(serde_json::from_slice(&body)?)
    }
}
