use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use super::events::RunRequest;
use super::stage::{Stage, StageContext, StageError, TaskResult};
use crate::config::Config;
use crate::types::job::JobAction;
use crate::types::task::{TaskPatch, TaskStatus};
use crate::wire::frames::ActionFrame;
use crate::wire::{Connection, Incoming};

/// Entry point of `kara-worker --stage <name>`: one task body, isolated in
/// its own process, speaking the event protocol over stdio. The parent
/// writes one [`RunRequest`] frame and optional stop actions; we stream
/// events back and exit cleanly — failures travel in-band as status
/// updates, a non-zero exit is reserved for crashes.
pub async fn run_stage(config: Arc<Config>, stage_name: &str) -> Result<()> {
    let mut stage = crate::stages::create(&config, stage_name)
        .ok_or_else(|| anyhow::anyhow!("unknown stage: {stage_name}"))?;

    let conn = Connection::from_parts(
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
        false,
        "parent".into(),
    );

    serve_request(&config, stage.as_mut(), conn, true).await
}

/// Serves one request over an established connection: read the args frame,
/// watch for stop actions, run the body, report the outcome. Shared
/// between the stdio child and the daemon accept loop.
pub async fn serve_request(
    config: &Arc<Config>,
    stage: &mut dyn Stage,
    mut conn: Connection,
    preload: bool,
) -> Result<()> {
    let request: RunRequest = conn.recv_as().await?;
    let sink = conn.write_handle();
    let interrupted = Arc::new(AtomicBool::new(false));

    // The connection moves into the action watcher; events go out through
    // the write handle, stop actions come back through the flag.
    let watcher_flag = interrupted.clone();
    let watcher = tokio::spawn(async move {
        loop {
            match conn.recv_idle().await {
                Ok(Incoming::Frame(frame)) => {
                    match serde_json::from_value::<ActionFrame>(frame) {
                        Ok(ActionFrame {
                            action: JobAction::Stop,
                        }) => {
                            info!("stop action received, raising interrupt");
                            watcher_flag.store(true, Ordering::SeqCst);
                        }
                        Ok(ActionFrame { action }) => {
                            warn!(?action, "unsupported action, ignoring")
                        }
                        Err(error) => warn!(%error, "unknown frame from parent, ignoring"),
                    }
                }
                Ok(Incoming::Bye) | Err(_) => break,
            }
        }
        conn
    });

    let ctx = StageContext::new(
        config.clone(),
        request.jid.clone(),
        sink.clone(),
        interrupted,
    );

    let outcome = execute(stage, &ctx, &request, preload).await;

    // Terminal reporting happens in cleanup mode: a pending interrupt must
    // not re-raise while we say how things ended.
    ctx.begin_cleanup();
    let patch = match outcome {
        Ok(TaskResult::Success) => TaskPatch {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        },
        Ok(TaskResult::SoftFailed(message)) => TaskPatch {
            status: Some(TaskStatus::SoftFailed),
            message: Some(message),
            ..Default::default()
        },
        Err(StageError::Interrupted) => TaskPatch {
            status: Some(TaskStatus::Interrupted),
            message: Some("Task interrupted".into()),
            ..Default::default()
        },
        Err(StageError::Failed(error)) => {
            let _ = ctx.error(format!("error in task: {error:#}")).await;
            TaskPatch {
                status: Some(TaskStatus::Failed),
                message: Some(error.to_string()),
                ..Default::default()
            }
        }
    };
    let _ = ctx.update(patch).await;

    // Bye closes our half; the watcher drains the ack and hands the
    // connection back so the writer flushes before we return.
    let _ = sink.send_bye().await;
    let _ = watcher.await;
    Ok(())
}

async fn execute(
    stage: &mut dyn Stage,
    ctx: &StageContext,
    request: &RunRequest,
    preload: bool,
) -> Result<TaskResult, StageError> {
    ctx.update(TaskPatch {
        status: Some(TaskStatus::Running),
        ..Default::default()
    })
    .await?;
    ctx.info(format!("----- {} -----", request.stage)).await?;
    ctx.debug(format!("arguments: {:?}", request.args)).await?;

    if preload {
        stage.preload(ctx).await?;
    }
    let result = stage.run(ctx, request).await;

    match &result {
        Ok(TaskResult::Success) => {
            ctx.begin_cleanup();
            let _ = ctx.info(format!("----- {} completed -----", request.stage)).await;
        }
        Ok(TaskResult::SoftFailed(message)) => {
            ctx.begin_cleanup();
            let _ = ctx
                .info(format!("soft failure in task {}: {message}", request.stage))
                .await;
        }
        Err(_) => {}
    }
    result
}
