use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::job::{JobPatch, Media};
use crate::types::task::{ArtifactType, TaskPatch};

/// The argument frame sent to a task body, whether it runs as a fresh
/// subprocess or behind a stage daemon.
///
/// On the wire: `{jid, stage, media:{…}, args:{…}}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRequest {
    pub jid: String,
    pub stage: String,
    pub media: Media,
    /// Union of the prerequisites' passing args.
    pub args: Map<String, Value>,
}

/// Body of a log event. `ignore_action` marks lines emitted after the task
/// began terminating, so late cleanup output does not re-raise the
/// interrupt on the parent side either.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogBody {
    pub message: String,
    #[serde(default)]
    pub ignore_action: bool,
}

/// An artifact emission. Composite payloads may carry attachments, which
/// are added first (recursively, as attached artifacts) with their indices
/// substituted into the payload under the attachment's name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub artifact: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub is_attached: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ArtifactSpec>,
}

/// A typed event streamed from a task body to its runner.
///
/// On the wire: `{target:"<kind>", body:{…}}`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "target", content = "body", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Task attribute changes worth logging.
    Update(TaskPatch),
    /// Task attribute changes already reflected elsewhere (progress
    /// messages, mostly).
    PassiveUpdate(TaskPatch),
    /// Job-level mutation, e.g. learned media metadata.
    Job(JobPatch),
    /// The dataflow output consumed by subsequent tasks.
    PassingArgs { args: Map<String, Value> },
    Artifact(ArtifactSpec),
    Info(LogBody),
    Debug(LogBody),
    Warning(LogBody),
    Error(LogBody),
    /// Raw text appended to the task output buffer verbatim.
    Output { message: String },
}
