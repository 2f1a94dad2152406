use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::{ArtifactSpec, RunRequest, TaskEvent};
use crate::config::Config;
use crate::stages::StageSpec;
use crate::types::job::{JobAction, JobPatch};
use crate::types::task::{TaskPatch, TaskStatus};
use crate::wire::frames::ActionFrame;
use crate::wire::{Connection, Incoming, WireError};

/// Commands from the engine to a task's runner.
#[derive(Debug)]
pub enum RunnerCommand {
    Run(RunRequest),
    /// Push a stop action into the running body.
    Interrupt,
    /// Cancel sentinel: no more work will come, wind the runner down.
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Debug,
    Warning,
    Error,
}

/// Events from a runner to the engine loop, which owns all task state.
#[derive(Debug)]
pub enum EngineEvent {
    Task {
        index: usize,
        patch: TaskPatch,
    },
    Job(JobPatch),
    PassingArgs {
        index: usize,
        args: Map<String, Value>,
    },
    Artifact {
        index: usize,
        spec: ArtifactSpec,
    },
    Log {
        index: usize,
        level: LogLevel,
        message: String,
    },
    Output {
        index: usize,
        text: String,
    },
    Finished {
        index: usize,
    },
}

/// One long-lived runner per task: preloads (probes for a stage daemon),
/// then blocks on its command channel, executing at most one body at a
/// time in an isolated subprocess or over the daemon socket.
pub async fn run_runner(
    index: usize,
    spec: &'static StageSpec,
    config: Arc<Config>,
    mut commands: mpsc::Receiver<RunnerCommand>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let daemon_socket = daemon_socket(&config, spec);
    if daemon_socket.is_some() {
        info!(stage = spec.key, "stage daemon found, will forward work to it");
    }

    while let Some(command) = commands.recv().await {
        match command {
            RunnerCommand::Shutdown => break,
            RunnerCommand::Interrupt => {
                debug!(stage = spec.key, "interrupt with no running body, ignoring")
            }
            RunnerCommand::Run(request) => {
                execute(index, spec, daemon_socket.as_deref(), &request, &mut commands, &events)
                    .await;
                let _ = events.send(EngineEvent::Finished { index });
            }
        }
    }
}

fn daemon_socket(config: &Config, spec: &StageSpec) -> Option<PathBuf> {
    if !spec.daemon {
        return None;
    }
    let socket = config.daemon_dir().join(format!("{}.sock", spec.key));
    socket.exists().then_some(socket)
}

async fn execute(
    index: usize,
    spec: &'static StageSpec,
    daemon_socket: Option<&std::path::Path>,
    request: &RunRequest,
    commands: &mut mpsc::Receiver<RunnerCommand>,
    events: &mpsc::UnboundedSender<EngineEvent>,
) {
    let (conn, child) = match open_transport(spec, daemon_socket).await {
        Ok(transport) => transport,
        Err(error) => {
            let _ = events.send(EngineEvent::Task {
                index,
                patch: TaskPatch {
                    status: Some(TaskStatus::Failed),
                    message: Some(format!("Failed to start task body: {error}")),
                    ..Default::default()
                },
            });
            return;
        }
    };
    let mut conn = conn;
    let mut child = child;

    if let Err(error) = conn.send(request).await {
        warn!(stage = spec.key, %error, "failed to send args to task body");
    }

    // Stream events until the body says bye or its transport drops; the
    // engine's interrupt turns into a stop action on the same channel.
    let mut explicit_terminal = false;
    loop {
        tokio::select! {
            incoming = conn.recv_idle() => match incoming {
                Ok(Incoming::Bye) => break,
                Ok(Incoming::Frame(frame)) => {
                    match serde_json::from_value::<TaskEvent>(frame) {
                        Ok(event) => {
                            explicit_terminal |= is_terminal_update(&event);
                            forward(index, event, events);
                        }
                        Err(error) => {
                            warn!(stage = spec.key, %error, "unknown frame from task body, ignoring")
                        }
                    }
                }
                Err(WireError::PeerGone) => break,
                Err(error) => {
                    warn!(stage = spec.key, %error, "task body stream error");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(RunnerCommand::Interrupt) => {
                    info!(stage = spec.key, "forwarding stop action to task body");
                    let _ = conn
                        .send(&ActionFrame { action: JobAction::Stop })
                        .await;
                }
                Some(RunnerCommand::Run(_)) => {
                    warn!(stage = spec.key, "task already running, dropping duplicate run")
                }
                Some(RunnerCommand::Shutdown) | None => break,
            },
        }
    }

    // A body that died without reporting how is a failure; for a fresh
    // subprocess the exit code names it.
    match child.take() {
        Some(mut child) => {
            let status = child.wait().await;
            let code = status
                .as_ref()
                .map(|s| s.code().unwrap_or(-1))
                .unwrap_or(-1);
            if code != 0 && !explicit_terminal {
                let _ = events.send(EngineEvent::Task {
                    index,
                    patch: TaskPatch {
                        status: Some(TaskStatus::Failed),
                        message: Some(format!("Task failed with exit code {code}")),
                        ..Default::default()
                    },
                });
            }
        }
        None => {
            if !explicit_terminal {
                let _ = events.send(EngineEvent::Task {
                    index,
                    patch: TaskPatch {
                        status: Some(TaskStatus::Failed),
                        message: Some("Task daemon connection lost".into()),
                        ..Default::default()
                    },
                });
            }
        }
    }

    conn.close().await;
}

/// Prefers a listening stage daemon; otherwise forks this binary in
/// `--stage` mode with the event protocol over its stdio.
async fn open_transport(
    spec: &StageSpec,
    daemon_socket: Option<&std::path::Path>,
) -> anyhow::Result<(Connection, Option<tokio::process::Child>)> {
    #[cfg(unix)]
    if let Some(socket) = daemon_socket {
        match tokio::net::UnixStream::connect(socket).await {
            Ok(stream) => return Ok((Connection::from_unix(stream, false), None)),
            Err(error) => {
                warn!(stage = spec.key, %error, "stage daemon unreachable, falling back to subprocess");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = daemon_socket;

    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg("--stage")
        .arg(spec.key)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stdin = child.stdin.take().expect("stdin piped");
    let conn = Connection::from_parts(
        Box::new(stdout),
        Box::new(stdin),
        false,
        format!("stage:{}", spec.key),
    );
    Ok((conn, Some(child)))
}

fn is_terminal_update(event: &TaskEvent) -> bool {
    match event {
        TaskEvent::Update(patch) => patch
            .status
            .map(|status| status.is_terminal())
            .unwrap_or(false),
        _ => false,
    }
}

fn forward(index: usize, event: TaskEvent, events: &mpsc::UnboundedSender<EngineEvent>) {
    let event = match event {
        TaskEvent::Update(patch) | TaskEvent::PassiveUpdate(patch) => {
            EngineEvent::Task { index, patch }
        }
        TaskEvent::Job(patch) => EngineEvent::Job(patch),
        TaskEvent::PassingArgs { args } => EngineEvent::PassingArgs { index, args },
        TaskEvent::Artifact(spec) => EngineEvent::Artifact { index, spec },
        TaskEvent::Info(body) => EngineEvent::Log {
            index,
            level: LogLevel::Info,
            message: body.message,
        },
        TaskEvent::Debug(body) => EngineEvent::Log {
            index,
            level: LogLevel::Debug,
            message: body.message,
        },
        TaskEvent::Warning(body) => EngineEvent::Log {
            index,
            level: LogLevel::Warning,
            message: body.message,
        },
        TaskEvent::Error(body) => EngineEvent::Log {
            index,
            level: LogLevel::Error,
            message: body.message,
        },
        TaskEvent::Output { message } => EngineEvent::Output {
            index,
            text: message,
        },
    };
    let _ = events.send(event);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::job::Media;
    use serde_json::json;

    fn request() -> RunRequest {
        RunRequest {
            jid: "j-1".into(),
            stage: "transcribe".into(),
            media: Media {
                source: "x".into(),
                metadata: Default::default(),
            },
            args: Map::new(),
        }
    }

    /// Boots a scripted daemon behind a socket and a runner pointed at it.
    async fn daemon_harness(
        script: impl FnOnce(Connection) -> tokio::task::JoinHandle<()> + Send + 'static,
    ) -> (
        mpsc::Sender<RunnerCommand>,
        mpsc::UnboundedReceiver<EngineEvent>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path()).unwrap());
        std::fs::create_dir_all(config.daemon_dir()).unwrap();
        let socket = config.daemon_dir().join("transcribe.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(Connection::from_unix(stream, true)).await.unwrap();
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_runner(
            0,
            &crate::stages::TRANSCRIBE,
            config,
            cmd_rx,
            event_tx,
        ));
        (cmd_tx, event_rx, dir)
    }

    #[tokio::test]
    async fn test_daemon_events_flow_to_engine() {
        let (commands, mut events, _dir) = daemon_harness(|mut conn| {
            tokio::spawn(async move {
                let request = conn.recv().await.unwrap();
                assert_eq!(request["stage"], "transcribe");
                conn.send(&json!({"target": "update", "body": {"status": "running"}}))
                    .await
                    .unwrap();
                conn.send(&json!({"target": "info", "body": {"message": "transcribing"}}))
                    .await
                    .unwrap();
                conn.send(&json!({"target": "passing_args", "body": {"args": {"transcript_path": "t.json"}}}))
                    .await
                    .unwrap();
                conn.send(&json!({"target": "update", "body": {"status": "completed"}}))
                    .await
                    .unwrap();
                conn.close().await;
            })
        })
        .await;

        commands
            .send(RunnerCommand::Run(request()))
            .await
            .unwrap();

        let mut statuses = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Task { patch, .. } => statuses.extend(patch.status),
                EngineEvent::Finished { index } => {
                    assert_eq!(index, 0);
                    break;
                }
                EngineEvent::PassingArgs { args, .. } => {
                    assert_eq!(args["transcript_path"], "t.json");
                }
                EngineEvent::Log { level, message, .. } => {
                    assert_eq!(level, LogLevel::Info);
                    assert_eq!(message, "transcribing");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(statuses, [TaskStatus::Running, TaskStatus::Completed]);

        commands.send(RunnerCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_dying_without_status_injects_failure() {
        let (commands, mut events, _dir) = daemon_harness(|mut conn| {
            tokio::spawn(async move {
                let _ = conn.recv().await.unwrap();
                conn.send(&json!({"target": "update", "body": {"status": "running"}}))
                    .await
                    .unwrap();
                // Dies without reporting a terminal status.
                drop(conn);
            })
        })
        .await;

        commands
            .send(RunnerCommand::Run(request()))
            .await
            .unwrap();

        let mut failed_message = None;
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Task { patch, .. } => {
                    if patch.status == Some(TaskStatus::Failed) {
                        failed_message = patch.message;
                    }
                }
                EngineEvent::Finished { .. } => break,
                _ => {}
            }
        }
        assert_eq!(failed_message.as_deref(), Some("Task daemon connection lost"));
    }

    #[tokio::test]
    async fn test_interrupt_forwards_stop_action() {
        let (commands, mut events, _dir) = daemon_harness(|mut conn| {
            tokio::spawn(async move {
                let _ = conn.recv().await.unwrap();
                conn.send(&json!({"target": "update", "body": {"status": "running"}}))
                    .await
                    .unwrap();
                // Wait for the stop action, then report interrupted.
                let action = conn.recv().await.unwrap();
                assert_eq!(action["action"], "stop");
                conn.send(&json!({"target": "update", "body": {"status": "interrupted", "message": "Task interrupted"}}))
                    .await
                    .unwrap();
                conn.close().await;
            })
        })
        .await;

        commands
            .send(RunnerCommand::Run(request()))
            .await
            .unwrap();
        // Give the body a moment to start, then interrupt.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        commands.send(RunnerCommand::Interrupt).await.unwrap();

        let mut last_status = None;
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Task { patch, .. } => last_status = patch.status.or(last_status),
                EngineEvent::Finished { .. } => break,
                _ => {}
            }
        }
        assert_eq!(last_status, Some(TaskStatus::Interrupted));
    }
}
