use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::WorkerJob;
use crate::config::Config;
use crate::types::job::{Job, JobAction, JobPatch};
use crate::wire::frames::{ActionFrame, Hello};
use crate::wire::{Connection, Incoming};

/// Binds this worker to the scheduler: announces the job id, receives the
/// job record, and returns the shared [`WorkerJob`] plus the binder task
/// that forwards updates out and actions in. The binder task finishes —
/// with the bye handshake — once [`WorkerJob::finish`] drops the update
/// channel.
pub async fn bind_scheduler(
    config: &Arc<Config>,
    job_id: &str,
) -> Result<(Arc<WorkerJob>, JoinHandle<()>)> {
    let addr = (config.scheduler_host.as_str(), config.scheduler_port);
    debug!(host = addr.0, port = addr.1, "connecting to scheduler");
    let stream = TcpStream::connect(addr).await?;
    let mut conn = Connection::from_tcp(stream, false);

    conn.send(&Hello::Worker {
        job_id: job_id.to_owned(),
    })
    .await?;
    let job: Job = conn.recv_as().await?;
    info!(jid = %job.jid, "received job from scheduler");

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let worker_job = WorkerJob::new(job, updates_tx);

    let binder_job = worker_job.clone();
    let binder = tokio::spawn(binder_loop(conn, updates_rx, binder_job));

    Ok((worker_job, binder))
}

/// Single owner of the scheduler connection: updates flow out in order
/// (one serialized writer), inbound frames are actions for the job.
async fn binder_loop(
    mut conn: Connection,
    mut updates: mpsc::UnboundedReceiver<JobPatch>,
    job: Arc<WorkerJob>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(patch) => {
                    if let Err(error) = conn.send(&patch).await {
                        error!(%error, "failed to push update to scheduler");
                        break;
                    }
                }
                // Channel dropped: the job is finished and fully reported.
                None => break,
            },
            incoming = conn.recv_idle() => match incoming {
                Ok(Incoming::Frame(frame)) => {
                    match serde_json::from_value::<ActionFrame>(frame) {
                        Ok(ActionFrame { action }) => {
                            info!(?action, "action received");
                            job.post_action(action);
                        }
                        Err(error) => warn!(%error, "unknown frame from scheduler, ignoring"),
                    }
                }
                Ok(Incoming::Bye) => {
                    info!("scheduler sent bye");
                    break;
                }
                Err(error) => {
                    error!(%error, "error receiving from scheduler");
                    break;
                }
            },
        }
    }

    // Flush whatever is still queued before the handshake.
    while let Ok(patch) = updates.try_recv() {
        if conn.send(&patch).await.is_err() {
            break;
        }
    }
    conn.close().await;
}

/// The command-line binder for `--url` / `--filepath` runs: progress
/// messages echo to the terminal, actions are read as lines from stdin.
pub fn bind_local(job: Job) -> (Arc<WorkerJob>, JoinHandle<()>) {
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<JobPatch>();
    let worker_job = WorkerJob::new(job, updates_tx);

    let echo = tokio::spawn(async move {
        while let Some(patch) = updates_rx.recv().await {
            let Some(tasks) = patch.tasks else { continue };
            for task in tasks.values() {
                if let Some(message) = &task.message {
                    if message.contains('\r') {
                        print!("{message}");
                        use std::io::Write;
                        let _ = std::io::stdout().flush();
                    }
                }
            }
        }
    });

    let action_job = worker_job.clone();
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_value::<JobAction>(serde_json::Value::from(
                line.trim().to_lowercase(),
            )) {
                Ok(action) => action_job.post_action(action),
                Err(_) => {
                    if !line.trim().is_empty() {
                        eprintln!("invalid command: {line}");
                    }
                }
            }
        }
    });

    (worker_job, echo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::{JobRequest, JobStatus, JobType, Media};
    use serde_json::json;

    #[tokio::test]
    async fn test_bind_update_action_finish_cycle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.ini"),
            format!("[scheduler]\nhost = 127.0.0.1\nport = {}\n", addr.port()),
        )
        .unwrap();
        let config = Arc::new(Config::load(dir.path()).unwrap());

        let job = Job::new(JobRequest {
            job_type: JobType::Youtube,
            media: Media {
                source: "x".into(),
                metadata: Default::default(),
            },
        });
        let jid = job.jid.clone();
        let job_frame = serde_json::to_value(&job).unwrap();

        let master = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::from_tcp(stream, true);

            let hello = conn.recv().await.unwrap();
            assert_eq!(hello["role"], "worker");
            conn.send(&job_frame).await.unwrap();

            // First update from the worker.
            let update = conn.recv().await.unwrap();
            assert_eq!(update["status"], "running");

            // Push a stop action down.
            conn.send(&json!({"action": "stop"})).await.unwrap();

            // Final update then bye.
            let last = conn.recv().await.unwrap();
            assert_eq!(last["status"], "completed");
            assert_eq!(last["isProcessExited"], true);
            match conn.recv_idle().await.unwrap() {
                Incoming::Bye => {}
                other => panic!("expected bye, got {other:?}"),
            }
            conn.close().await;
        });

        let (worker_job, binder) = bind_scheduler(&config, &jid).await.unwrap();
        assert_eq!(worker_job.jid(), jid);

        worker_job.update(JobPatch::status(JobStatus::Running));

        // The pushed action lands in the mailbox.
        worker_job.action_changed().await;
        assert_eq!(worker_job.action(), Some(JobAction::Stop));

        // No tasks ran, so the outcome is completed.
        let outcome = worker_job.finish();
        assert_eq!(outcome, JobStatus::Completed);

        binder.await.unwrap();
        master.await.unwrap();
    }
}
