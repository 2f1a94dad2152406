use serde::{Deserialize, Serialize};

/// Lifecycle of one task inside a job.
///
/// `Interrupting` is terminal-bound: the only transition out of it is to
/// `Interrupted`. Everything from `Completed` down is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Interrupting,
    Interrupted,
    Completed,
    SoftFailed,
    Failed,
    Canceled,
    Skipped,
}

impl TaskStatus {
    pub fn is_pending(self) -> bool {
        self == TaskStatus::Pending
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Queued | TaskStatus::Interrupting
        )
    }

    /// Success states satisfy prerequisites: a soft failure counts as
    /// "couldn't do it, but carry on".
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::SoftFailed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Interrupted
                | TaskStatus::Completed
                | TaskStatus::SoftFailed
                | TaskStatus::Failed
                | TaskStatus::Canceled
                | TaskStatus::Skipped
        )
    }
}

/// Kind of a produced output. Video and audio payloads are file paths
/// relative to the media path; the rest are inline text or JSON.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Video,
    Audio,
    Json,
    Text,
    Segments,
}

impl ArtifactType {
    /// Composite types may carry attachments whose indices get substituted
    /// into the payload.
    pub fn is_composite(self) -> bool {
        matches!(self, ArtifactType::Json | ArtifactType::Segments)
    }
}

/// Handle to an artifact recorded on a task. The payload itself lives on
/// the job's artifact list, addressed by `aid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub aid: usize,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub is_attached: bool,
}

/// Wire-visible state of one task, keyed by tid on the job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskState {
    pub tid: String,
    pub name: String,
    pub message: Option<String>,
    /// Accumulated stdout/stderr/log text for this task.
    pub output: String,
    pub status: TaskStatus,
    pub artifacts: Vec<Artifact>,
}

/// Partial update to a task, as produced by workers and merged by the
/// master. Absent fields are untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,
}

impl TaskState {
    pub fn new(tid: String, name: String) -> TaskState {
        TaskState {
            tid,
            name,
            message: None,
            output: String::new(),
            status: TaskStatus::Pending,
            artifacts: Vec::new(),
        }
    }

    /// Creates a task from a patch carrying an unknown tid.
    pub fn from_patch(tid: String, patch: TaskPatch) -> TaskState {
        let mut task = TaskState::new(tid, patch.name.clone().unwrap_or_default());
        task.apply(patch);
        task
    }

    /// Merges a partial update. Once terminal, the status may not move and
    /// the message may not be rewritten; `Interrupting` only accepts
    /// `Interrupted`.
    pub fn apply(&mut self, patch: TaskPatch) {
        let was_terminal = self.status.is_terminal();
        if let Some(status) = patch.status {
            if self.accepts(status) {
                self.status = status;
            }
        }
        if let Some(message) = patch.message {
            if !was_terminal {
                self.message = Some(message);
            }
        }
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(output) = patch.output {
            // The output buffer is append-only; never let a stale frame
            // truncate it.
            if output.len() >= self.output.len() {
                self.output = output;
            }
        }
        if let Some(artifacts) = patch.artifacts {
            if artifacts.len() >= self.artifacts.len() {
                self.artifacts = artifacts;
            }
        }
    }

    fn accepts(&self, next: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return next == self.status;
        }
        if self.status == TaskStatus::Interrupting {
            return matches!(next, TaskStatus::Interrupted | TaskStatus::Interrupting);
        }
        true
    }

    /// Final sweep when the owning process exits: anything not yet settled
    /// is closed out.
    pub fn done(&mut self) {
        match self.status {
            TaskStatus::Pending | TaskStatus::Queued => {
                self.status = TaskStatus::Canceled;
                self.message = Some("Job canceled due to process exit".into());
            }
            TaskStatus::Running => {
                self.status = TaskStatus::Interrupted;
                self.message = Some("Job interrupted due to process exit".into());
            }
            TaskStatus::Interrupting => {
                self.status = TaskStatus::Interrupted;
                self.message = Some("Job interrupted due to process exit".into());
            }
            _ => {}
        }
    }
}
