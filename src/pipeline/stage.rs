use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::events::{ArtifactSpec, LogBody, TaskEvent};
use crate::config::Config;
use crate::types::job::{JobPatch, MediaPatch};
use crate::types::task::TaskPatch;
use crate::wire::WriteHandle;

/// How a task body ended, short of an error.
#[derive(Debug)]
pub enum TaskResult {
    Success,
    /// "I couldn't do it, but carry on": passing args still flow and
    /// subsequents still run.
    SoftFailed(String),
}

/// Why a task body stopped.
#[derive(Debug)]
pub enum StageError {
    Failed(anyhow::Error),
    /// The cooperative interrupt fired at a checkpoint.
    Interrupted,
}

impl From<anyhow::Error> for StageError {
    fn from(value: anyhow::Error) -> Self {
        StageError::Failed(value)
    }
}

impl From<std::io::Error> for StageError {
    fn from(value: std::io::Error) -> Self {
        StageError::Failed(value.into())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(value: serde_json::Error) -> Self {
        StageError::Failed(value.into())
    }
}

pub type StageResult = Result<TaskResult, StageError>;

/// One task body. Implementations drive external tools or pure
/// computations; everything they report flows through the [`StageContext`].
pub trait Stage: Send {
    /// Optional heavy init (model loads); runs once per process, before any
    /// request in daemon mode.
    fn preload<'a>(&'a mut self, _ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async { Ok(()) })
    }

    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a super::events::RunRequest,
    ) -> BoxFuture<'a, StageResult>;
}

/// The sink a task body reports through, plus the cooperative interrupt
/// flag. Every log/emit call is an interrupt checkpoint: once the parent
/// pushed a stop action, the next checkpoint returns
/// [`StageError::Interrupted`] — unless the context has been switched to
/// cleanup mode, where events carry `ignore_action` and nothing re-raises.
pub struct StageContext {
    config: Arc<Config>,
    jid: String,
    sink: Option<WriteHandle>,
    interrupted: Arc<AtomicBool>,
    cleanup: AtomicBool,
}

impl StageContext {
    pub fn new(
        config: Arc<Config>,
        jid: String,
        sink: WriteHandle,
        interrupted: Arc<AtomicBool>,
    ) -> StageContext {
        StageContext {
            config,
            jid,
            sink: Some(sink),
            interrupted,
            cleanup: AtomicBool::new(false),
        }
    }

    /// A context with no parent behind it, for daemon preloads: events are
    /// dropped, interrupts never fire.
    pub fn detached(config: Arc<Config>) -> StageContext {
        StageContext {
            config,
            jid: String::new(),
            sink: None,
            interrupted: Arc::new(AtomicBool::new(false)),
            cleanup: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// Canonical per-job cache location for this stage.
    pub fn cache_path(&self, stage: &str) -> PathBuf {
        self.config.cache_path(&self.jid, stage)
    }

    /// Switches to cleanup mode: subsequent events carry `ignore_action`
    /// and no checkpoint re-raises the interrupt.
    pub fn begin_cleanup(&self) {
        self.cleanup.store(true, Ordering::SeqCst);
    }

    /// The bare interrupt checkpoint, for compute loops with no output.
    pub fn check_interrupt(&self) -> Result<(), StageError> {
        if self.interrupted.load(Ordering::SeqCst) && !self.cleanup.load(Ordering::SeqCst) {
            return Err(StageError::Interrupted);
        }
        Ok(())
    }

    async fn emit(&self, event: TaskEvent) -> Result<(), StageError> {
        if let Some(sink) = &self.sink {
            sink.send(&event)
                .await
                .map_err(|e| StageError::Failed(e.into()))?;
        }
        Ok(())
    }

    fn log_body(&self, message: String) -> LogBody {
        LogBody {
            message,
            ignore_action: self.cleanup.load(Ordering::SeqCst),
        }
    }

    pub async fn info(&self, message: impl Into<String>) -> Result<(), StageError> {
        self.emit(TaskEvent::Info(self.log_body(message.into()))).await?;
        self.check_interrupt()
    }

    pub async fn debug(&self, message: impl Into<String>) -> Result<(), StageError> {
        self.emit(TaskEvent::Debug(self.log_body(message.into()))).await?;
        self.check_interrupt()
    }

    pub async fn warning(&self, message: impl Into<String>) -> Result<(), StageError> {
        self.emit(TaskEvent::Warning(self.log_body(message.into()))).await?;
        self.check_interrupt()
    }

    pub async fn error(&self, message: impl Into<String>) -> Result<(), StageError> {
        self.emit(TaskEvent::Error(self.log_body(message.into()))).await?;
        self.check_interrupt()
    }

    /// A logged attribute change.
    pub async fn update(&self, patch: TaskPatch) -> Result<(), StageError> {
        self.emit(TaskEvent::Update(patch)).await?;
        self.check_interrupt()
    }

    /// An attribute change already visible elsewhere (progress lines).
    pub async fn passive_message(&self, message: impl Into<String>) -> Result<(), StageError> {
        self.emit(TaskEvent::PassiveUpdate(TaskPatch {
            message: Some(message.into()),
            ..Default::default()
        }))
        .await?;
        self.check_interrupt()
    }

    /// Job-level mutation, e.g. media metadata learned by a probe.
    pub async fn update_job(&self, patch: JobPatch) -> Result<(), StageError> {
        self.emit(TaskEvent::Job(patch)).await?;
        self.check_interrupt()
    }

    /// Convenience for the common metadata case.
    pub async fn update_metadata(
        &self,
        metadata: Map<String, Value>,
    ) -> Result<(), StageError> {
        self.update_job(JobPatch {
            media: Some(MediaPatch {
                source: None,
                metadata: Some(metadata.into_iter().collect()),
            }),
            ..Default::default()
        })
        .await
    }

    pub async fn set_passing_args(&self, args: Map<String, Value>) -> Result<(), StageError> {
        self.emit(TaskEvent::PassingArgs { args }).await?;
        self.check_interrupt()
    }

    pub async fn add_artifact(&self, spec: ArtifactSpec) -> Result<(), StageError> {
        self.emit(TaskEvent::Artifact(spec)).await?;
        self.check_interrupt()
    }
}

/// Pulls a required string argument out of the merged passing args.
pub fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, StageError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::Failed(anyhow::anyhow!("missing argument: {key}")))
}
