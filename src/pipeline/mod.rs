//! The task pipeline engine: a DAG of tasks attached to a job, built once
//! and run once. Each task owns a long-lived runner which executes the
//! task body in an isolated subprocess (or behind a stage daemon) and
//! streams typed events back; the engine loop owns all task state and is
//! the only writer of job updates.

pub mod child;
pub mod daemon;
pub mod events;
pub mod progress;
pub mod runner;
pub mod stage;

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::events::{ArtifactSpec, RunRequest};
use self::runner::{EngineEvent, LogLevel, RunnerCommand};
use crate::config::Config;
use crate::stages::{StageSpec, TaskDef};
use crate::types::job::{JobAction, JobPatch, JobStatus};
use crate::types::task::{Artifact, TaskPatch, TaskState, TaskStatus};
use crate::worker::job::WorkerJob;

struct Node {
    spec: &'static StageSpec,
    state: TaskState,
    prerequisites: Vec<usize>,
    subsequents: Vec<usize>,
    countdown: usize,
    passing_args: Map<String, Value>,
    /// Set once the task's completion has been propagated to subsequents.
    settled: bool,
}

/// A built pipeline, ready to run against a job.
pub struct Pipeline {
    config: Arc<Config>,
    job: Arc<WorkerJob>,
    nodes: Vec<Node>,
    commands: Vec<mpsc::Sender<RunnerCommand>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    runners: JoinSet<()>,
    running: usize,
    interrupting: bool,
}

impl Pipeline {
    pub fn build(config: Arc<Config>, job: Arc<WorkerJob>, defs: Vec<TaskDef>) -> Pipeline {
        let mut nodes: Vec<Node> = Vec::with_capacity(defs.len());
        for def in &defs {
            nodes.push(Node {
                spec: def.spec,
                state: TaskState::new(Uuid::new_v4().to_string(), def.spec.label.to_owned()),
                prerequisites: def.prerequisites.clone(),
                subsequents: Vec::new(),
                countdown: def.prerequisites.len(),
                passing_args: Map::new(),
                settled: false,
            });
        }
        for (index, def) in defs.iter().enumerate() {
            for &p in &def.prerequisites {
                nodes[p].subsequents.push(index);
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Pipeline {
            config,
            job,
            nodes,
            commands: Vec::new(),
            events_tx,
            events_rx,
            runners: JoinSet::new(),
            running: 0,
            interrupting: false,
        }
    }

    /// Runs the DAG to completion: every task ends in a terminal state and
    /// every runner is joined before this returns.
    pub async fn run(mut self) {
        info!(jid = %self.job.jid(), "starting pipeline");
        self.job.update(JobPatch::status(JobStatus::Running));

        // Announce the tasks, then spawn one runner per task; each
        // preloads and parks on its argument channel.
        for index in 0..self.nodes.len() {
            let node = &self.nodes[index];
            self.job.update(JobPatch::task(
                &node.state.tid,
                TaskPatch {
                    name: Some(node.state.name.clone()),
                    status: Some(TaskStatus::Pending),
                    output: Some(String::new()),
                    ..Default::default()
                },
            ));
        }
        for index in 0..self.nodes.len() {
            let (tx, rx) = mpsc::channel(4);
            self.commands.push(tx);
            self.runners.spawn(runner::run_runner(
                index,
                self.nodes[index].spec,
                self.config.clone(),
                rx,
                self.events_tx.clone(),
            ));
        }

        let mut pending: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&index| self.nodes[index].countdown == 0)
            .collect();

        loop {
            while let Some(index) = pending.pop_front() {
                self.dispatch(index, &mut pending).await;
            }
            self.check_action(&mut pending).await;

            if self.running == 0 && pending.is_empty() {
                if self.nodes.iter().all(|node| node.settled) {
                    break;
                }
                // Nothing runs but unsettled nodes remain: their
                // prerequisites never settled either — a stuck graph would
                // be a programmer error, not a runtime state.
                debug_assert!(
                    false,
                    "pipeline stalled with unsettled tasks and nothing running"
                );
                break;
            }

            tokio::select! {
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle(event, &mut pending);
                    }
                }
                _ = self.job.action_changed(), if !self.interrupting => {}
            }
        }

        // Cancel sentinel to every runner, then join them all.
        for tx in &self.commands {
            let _ = tx.send(RunnerCommand::Shutdown).await;
        }
        while self.runners.join_next().await.is_some() {}
        info!(jid = %self.job.jid(), "pipeline completed");
    }

    /// Starts a ready task, or cancels it when a prerequisite ended badly.
    async fn dispatch(&mut self, index: usize, pending: &mut VecDeque<usize>) {
        if self.nodes[index].state.status != TaskStatus::Pending {
            return;
        }

        let broken = self.nodes[index]
            .prerequisites
            .iter()
            .find(|&&p| !self.nodes[p].state.status.is_success());
        if let Some(&p) = broken {
            let reason = format!(
                "Task canceled due to incomplete prerequisite: {}",
                self.nodes[p].state.name
            );
            self.cancel(index, reason, pending);
            return;
        }

        self.apply_task(
            index,
            TaskPatch {
                status: Some(TaskStatus::Queued),
                message: Some("Waiting for preloading to complete".into()),
                ..Default::default()
            },
        );

        let mut args = Map::new();
        for &p in &self.nodes[index].prerequisites {
            for (key, value) in &self.nodes[p].passing_args {
                args.insert(key.clone(), value.clone());
            }
        }
        let request = RunRequest {
            jid: self.job.jid(),
            stage: self.nodes[index].spec.key.to_owned(),
            media: self.job.media(),
            args,
        };

        if self.commands[index]
            .send(RunnerCommand::Run(request))
            .await
            .is_err()
        {
            error!(stage = self.nodes[index].spec.key, "runner unavailable");
            self.cancel(index, "Task canceled due to runner loss".into(), pending);
            return;
        }
        self.running += 1;
    }

    fn cancel(&mut self, index: usize, reason: String, pending: &mut VecDeque<usize>) {
        self.apply_task(
            index,
            TaskPatch {
                status: Some(TaskStatus::Canceled),
                message: Some(reason),
                ..Default::default()
            },
        );
        self.settle(index, pending);
    }

    /// Propagates a finished task to its subsequents exactly once.
    fn settle(&mut self, index: usize, pending: &mut VecDeque<usize>) {
        if self.nodes[index].settled {
            return;
        }
        self.nodes[index].settled = true;
        let subsequents = self.nodes[index].subsequents.clone();
        for s in subsequents {
            self.nodes[s].countdown -= 1;
            if self.nodes[s].countdown == 0 {
                pending.push_back(s);
            }
        }
    }

    /// Applies a task patch locally (with the status guards) and forwards
    /// it upstream.
    fn apply_task(&mut self, index: usize, patch: TaskPatch) {
        let node = &mut self.nodes[index];
        node.state.apply(patch.clone());
        self.job.update(JobPatch::task(&node.state.tid, patch));
    }

    fn handle(&mut self, event: EngineEvent, pending: &mut VecDeque<usize>) {
        match event {
            EngineEvent::Task { index, patch } => self.apply_task(index, patch),
            EngineEvent::Job(patch) => self.job.update(patch),
            EngineEvent::PassingArgs { index, args } => {
                for (key, value) in args {
                    self.nodes[index].passing_args.insert(key, value);
                }
            }
            EngineEvent::Artifact { index, spec } => {
                self.add_artifact(index, spec);
            }
            EngineEvent::Log {
                index,
                level,
                message,
            } => {
                let stage = self.nodes[index].spec.key;
                match level {
                    LogLevel::Info => info!(stage, "{message}"),
                    LogLevel::Debug => debug!(stage, "{message}"),
                    LogLevel::Warning => warn!(stage, "{message}"),
                    LogLevel::Error => error!(stage, "{message}"),
                }
                self.append_output(index, &message, true);
            }
            EngineEvent::Output { index, text } => self.append_output(index, &text, false),
            EngineEvent::Finished { index } => {
                self.running -= 1;
                self.settle(index, pending);
            }
        }
    }

    /// The task output buffer accumulates log lines and raw tool output;
    /// listeners see the whole buffer on every flush.
    fn append_output(&mut self, index: usize, text: &str, line: bool) {
        let node = &mut self.nodes[index];
        node.state.output.push_str(text);
        if line {
            node.state.output.push('\n');
        }
        let output = node.state.output.clone();
        self.job.update(JobPatch::task(
            &node.state.tid,
            TaskPatch {
                output: Some(output),
                ..Default::default()
            },
        ));
    }

    /// Appends an artifact to the job, resolving composite attachments
    /// recursively: every attachment is added first as an attached
    /// artifact and its index substituted into the payload under the
    /// attachment's name.
    fn add_artifact(&mut self, index: usize, spec: ArtifactSpec) -> usize {
        let ArtifactSpec {
            name,
            artifact_type,
            artifact,
            tag,
            is_attached,
            attachments,
        } = spec;

        let payload = if artifact_type.is_composite() {
            let mut value = artifact;
            for attachment in attachments {
                let attachment_name = attachment.name.clone();
                let aid = self.add_artifact(
                    index,
                    ArtifactSpec {
                        is_attached: true,
                        ..attachment
                    },
                );
                if let Some(object) = value.as_object_mut() {
                    object.insert(attachment_name, Value::from(aid));
                }
            }
            serde_json::to_string(&value).unwrap_or_default()
        } else {
            if !attachments.is_empty() {
                warn!(%name, "attachments are only supported on composite artifacts, ignoring");
            }
            match artifact {
                Value::String(path) => self.sentinize(&path),
                other => other.to_string(),
            }
        };

        let (aid, artifacts, tags) =
            self.job
                .add_artifact(artifact_type, payload, tag.as_deref());
        self.job.update(JobPatch {
            artifacts: Some(artifacts),
            artifact_tags: Some(tags),
            ..Default::default()
        });

        let node = &mut self.nodes[index];
        node.state.artifacts.push(Artifact {
            aid,
            name,
            artifact_type,
            is_attached,
        });
        let recorded = node.state.artifacts.clone();
        self.job.update(JobPatch::task(
            &node.state.tid,
            TaskPatch {
                artifacts: Some(recorded),
                ..Default::default()
            },
        ));
        aid
    }

    /// Media paths inside the media directory are stored relative to it.
    fn sentinize(&self, path: &str) -> String {
        let p = std::path::Path::new(path);
        if !p.exists() {
            return path.to_owned();
        }
        let media = match self.config.media_path.canonicalize() {
            Ok(media) => media,
            Err(_) => return path.to_owned(),
        };
        match p.canonicalize() {
            Ok(abs) => abs
                .strip_prefix(&media)
                .map(|rel| rel.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.to_owned()),
            Err(_) => path.to_owned(),
        }
    }

    /// Reacts to a posted stop action: pending tasks cancel, running ones
    /// go interrupting and their bodies get the stop pushed.
    async fn check_action(&mut self, pending: &mut VecDeque<usize>) {
        if self.interrupting {
            return;
        }
        match self.job.action() {
            Some(JobAction::Stop) => {}
            Some(action) => {
                warn!(?action, "unsupported job action, ignoring");
                return;
            }
            None => return,
        }

        info!(jid = %self.job.jid(), "stopping job execution");
        self.interrupting = true;
        self.job.update(JobPatch::status(JobStatus::Interrupting));

        for index in 0..self.nodes.len() {
            match self.nodes[index].state.status {
                TaskStatus::Pending => {
                    self.cancel(index, "Task canceled due to job interrupt".into(), pending)
                }
                TaskStatus::Queued | TaskStatus::Running => {
                    self.apply_task(
                        index,
                        TaskPatch {
                            status: Some(TaskStatus::Interrupting),
                            ..Default::default()
                        },
                    );
                    let _ = self.commands[index].send(RunnerCommand::Interrupt).await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::{Job, JobRequest, JobType, Media};

    fn worker_job() -> (
        Arc<WorkerJob>,
        mpsc::UnboundedReceiver<JobPatch>,
    ) {
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

    fn pipeline_with(defs: Vec<TaskDef>) -> (Pipeline, mpsc::UnboundedReceiver<JobPatch>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path()).unwrap());
        std::mem::forget(dir);
        let (job, rx) = worker_job();
        (Pipeline::build(config, job, defs), rx)
    }

    fn defs(edges: &[&[usize]]) -> Vec<TaskDef> {
        edges
            .iter()
            .map(|prereqs| TaskDef {
                spec: &crate::stages::FETCH_LYRICS,
                prerequisites: prereqs.to_vec(),
            })
            .collect()
    }

    #[test]
    fn test_build_computes_edges_and_countdowns() {
        // A → B → C plus A → C.
        let (pipeline, _rx) = pipeline_with(defs(&[&[], &[0], &[0, 1]]));
        assert_eq!(pipeline.nodes[0].subsequents, vec![1, 2]);
        assert_eq!(pipeline.nodes[1].subsequents, vec![2]);
        assert_eq!(pipeline.nodes[2].countdown, 2);
    }

    #[test]
    fn test_settle_cascades_readiness() {
        let (mut pipeline, _rx) = pipeline_with(defs(&[&[], &[0], &[0, 1]]));
        let mut pending = VecDeque::new();
        pipeline.settle(0, &mut pending);
        assert_eq!(pending, VecDeque::from([1]));
        pipeline.settle(0, &mut pending); // idempotent
        assert_eq!(pending, VecDeque::from([1]));
        pipeline.settle(1, &mut pending);
        assert_eq!(pending, VecDeque::from([1, 2]));
    }

    // S5: A → B → C with B failing ends with C canceled, naming B.
    #[tokio::test]
    async fn test_broken_prerequisite_cancels_dependent() {
        let (mut pipeline, _rx) = pipeline_with(defs(&[&[], &[0]]));
        let mut pending = VecDeque::new();

        pipeline.apply_task(
            0,
            TaskPatch {
                status: Some(TaskStatus::Failed),
                message: Some("boom".into()),
                ..Default::default()
            },
        );
        pipeline.settle(0, &mut pending);
        assert_eq!(pending, VecDeque::from([1]));

        let index = pending.pop_front().unwrap();
        pipeline.dispatch(index, &mut pending).await;
        let state = &pipeline.nodes[1].state;
        assert_eq!(state.status, TaskStatus::Canceled);
        assert!(state.message.as_ref().unwrap().contains("Lyrics Fetching"));
        // The canceled task settled without ever running.
        assert!(pipeline.nodes[1].settled);
        assert_eq!(pipeline.running, 0);
    }

    #[tokio::test]
    async fn test_soft_failed_prerequisite_still_runs_dependent() {
        let (mut pipeline, _rx) = pipeline_with(defs(&[&[], &[0]]));
        let mut pending = VecDeque::new();

        pipeline.apply_task(
            0,
            TaskPatch {
                status: Some(TaskStatus::SoftFailed),
                message: Some("No lyrics available".into()),
                ..Default::default()
            },
        );
        pipeline.nodes[0]
            .passing_args
            .insert("lyrics".into(), Value::from("la la"));
        pipeline.settle(0, &mut pending);

        // Spawn a runner so the dispatch has somewhere to send.
        let (tx, mut rx) = mpsc::channel(4);
        pipeline.commands = vec![mpsc::channel(4).0, tx];

        let index = pending.pop_front().unwrap();
        pipeline.dispatch(index, &mut pending).await;
        assert_eq!(pipeline.nodes[1].state.status, TaskStatus::Queued);
        assert_eq!(pipeline.running, 1);

        // The dependent received the soft-failed task's passing args.
        let RunnerCommand::Run(request) = rx.recv().await.unwrap() else {
            panic!("expected run command");
        };
        assert_eq!(request.args["lyrics"], "la la");
    }

    #[tokio::test]
    async fn test_stop_action_cancels_pending_and_interrupts_running() {
        let (mut pipeline, _rx) = pipeline_with(defs(&[&[], &[0]]));
        let mut pending = VecDeque::new();

        // Task 0 is running, task 1 still pending.
        let (tx0, mut rx0) = mpsc::channel(4);
        pipeline.commands = vec![tx0, mpsc::channel(4).0];
        pipeline.apply_task(
            0,
            TaskPatch {
                status: Some(TaskStatus::Running),
                ..Default::default()
            },
        );

        pipeline.job.post_action(JobAction::Stop);
        pipeline.check_action(&mut pending).await;

        assert_eq!(pipeline.nodes[0].state.status, TaskStatus::Interrupting);
        assert_eq!(pipeline.nodes[1].state.status, TaskStatus::Canceled);
        assert!(matches!(
            rx0.recv().await.unwrap(),
            RunnerCommand::Interrupt
        ));

        // Interrupted report from the body is accepted; completed is not.
        pipeline.apply_task(
            0,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        );
        assert_eq!(pipeline.nodes[0].state.status, TaskStatus::Interrupting);
        pipeline.apply_task(
            0,
            TaskPatch {
                status: Some(TaskStatus::Interrupted),
                ..Default::default()
            },
        );
        assert_eq!(pipeline.nodes[0].state.status, TaskStatus::Interrupted);
    }

    #[tokio::test]
    async fn test_composite_artifact_attachments() {
        let (mut pipeline, mut rx) = pipeline_with(defs(&[&[]]));

        let aid = pipeline.add_artifact(
            0,
            ArtifactSpec {
                name: "mapped".into(),
                artifact_type: crate::types::task::ArtifactType::Segments,
                artifact: serde_json::json!({"lines": 12}),
                tag: Some("mapped".into()),
                is_attached: false,
                attachments: vec![ArtifactSpec {
                    name: "preview".into(),
                    artifact_type: crate::types::task::ArtifactType::Audio,
                    artifact: Value::from("preview.wav"),
                    tag: None,
                    is_attached: false,
                    attachments: Vec::new(),
                }],
            },
        );

        // The attachment landed first, so the composite's index is 1.
        assert_eq!(aid, 1);
        let job = pipeline.job.snapshot();
        assert_eq!(job.artifacts.len(), 2);
        assert_eq!(job.artifacts[0].1, "preview.wav");
        let payload: Value = serde_json::from_str(&job.artifacts[1].1).unwrap();
        assert_eq!(payload["preview"], 0);
        assert_eq!(payload["lines"], 12);
        assert_eq!(job.artifact_tags["mapped"], 1);

        // Task-side handles mark the attachment.
        let handles = &pipeline.nodes[0].state.artifacts;
        assert!(handles[0].is_attached);
        assert!(!handles[1].is_attached);

        // Updates were forwarded upstream.
        let mut saw_artifacts = false;
        while let Ok(patch) = rx.try_recv() {
            saw_artifacts |= patch.artifacts.is_some();
        }
        assert!(saw_artifacts);
    }
}
