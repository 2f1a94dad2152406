pub mod jobs;
pub mod slaves;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Level};

use self::jobs::JobRegistry;
use self::slaves::SlavePool;
use crate::config::Config;
use crate::types::job::{Job, JobAction, JobPatch, JobStatus};
use crate::wire::frames::{ActionFrame, ArtifactReply, Hello, UserAction};
use crate::wire::{Connection, Incoming, WireError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("No slaves available")]
    NoSlavesAvailable,
    #[error("Submit timed out")]
    SubmitTimeout,
    #[error("Failed to submit job {0}")]
    SubmitFailed(String),
}

/// The scheduler master: owns the job registry and the slave pool, accepts
/// user, worker, and slave connections on one port, and multiplexes them by
/// the first frame's role.
pub struct Master {
    registry: JobRegistry,
    slaves: SlavePool,
}

impl Master {
    pub fn new(config: Arc<Config>) -> Arc<Master> {
        Arc::new(Master {
            registry: JobRegistry::load(config),
            slaves: SlavePool::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Accepts connections until cancelled, handling each in its own task.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "scheduler listening");

        loop {
            match select! {
                accept = listener.accept() => accept,
                _ = cancel.cancelled() => return Ok(()),
            } {
                Ok((conn, _)) => {
                    let master = self.clone();
                    tokio::spawn(async move {
                        let _ = master.handle_connection(conn).await;
                    });
                },
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };
        }
    }

    #[instrument(name = "connection", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
    async fn handle_connection(self: Arc<Self>, conn: TcpStream) -> Result<()> {
        debug!("accepted connection");
        conn.set_nodelay(true).context("setting NODELAY")?;
        let mut conn = Connection::from_tcp(conn, true);

        let hello: Hello = match conn.recv_as().await {
            Ok(hello) => hello,
            Err(error) => {
                let _ = conn.send_error(&format!("Error: {error}")).await;
                conn.close().await;
                return Err(error.into());
            }
        };

        let result = match hello {
            Hello::User(action) => self.handle_user(&mut conn, action).await,
            Hello::Worker { job_id } => self.handle_worker(&mut conn, &job_id).await,
            Hello::Slave { slave_id } => {
                // The pool owns the connection from here on.
                self.slaves.serve(slave_id, conn).await;
                return Ok(());
            }
        };

        if let Err(error) = &result {
            let _ = conn.send_error(&format!("Error: {error}")).await;
        }
        conn.close().await;
        result
    }

    async fn handle_user(&self, conn: &mut Connection, action: UserAction) -> Result<()> {
        match action {
            UserAction::Submit { job } => self.submit(conn, Job::new(job)).await,
            UserAction::Query { job_id } => self.query(conn, &job_id).await,
            UserAction::Artifact { job_id, artifact } => {
                self.artifact(conn, &job_id, artifact).await
            }
            UserAction::Stop { job_id } => self.forward_action(conn, &job_id, JobAction::Stop).await,
            UserAction::Pause { job_id } => {
                self.forward_action(conn, &job_id, JobAction::Pause).await
            }
            UserAction::Restart { job_id } => {
                self.forward_action(conn, &job_id, JobAction::Restart).await
            }
        }
    }

    /// Creates the job, places it on a slave, and only then replies with
    /// the record; a failed placement is rolled back and surfaced as an
    /// error frame, leaving no queued record behind.
    async fn submit(&self, conn: &mut Connection, job: Job) -> Result<()> {
        let jid = job.jid.clone();
        let live = self.registry.insert(job);
        live.update(JobPatch::status(JobStatus::Queued));

        match self.slaves.submit(&jid).await {
            Ok(process) => {
                info!(%jid, pid = process.pid, "created job");
                live.attach(process);
                conn.send(&live.snapshot()).await?;
                Ok(())
            }
            Err(error) => {
                warn!(%jid, %error, "failed to place job");
                self.registry.remove(&jid);
                conn.send_error(&error.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Subscribes the connection to one job's update stream (or all jobs
    /// for `"*"`) until it says bye.
    async fn query(&self, conn: &mut Connection, job_id: &str) -> Result<()> {
        let listener_id = self.registry.listener_id();
        let handle = conn.write_handle();

        if job_id == "*" {
            self.registry.add_global_listener(listener_id, handle);
            self.idle_until_bye(conn).await;
            self.registry.remove_global_listener(listener_id);
            return Ok(());
        }

        if let Some(live) = self.registry.get(job_id) {
            live.add_listener(listener_id, handle);
            self.idle_until_bye(conn).await;
            live.remove_listener(listener_id);
            return Ok(());
        }

        // Not live any more; a dumped record still answers with its final
        // snapshot.
        match self.registry.find_job(job_id) {
            Some(job) => {
                conn.send(&serde_json::to_value(&job)?).await?;
                self.idle_until_bye(conn).await;
                Ok(())
            }
            None => {
                conn.send_error("Job not found").await?;
                Ok(())
            }
        }
    }

    /// Drains the connection until the peer says bye or drops; listeners
    /// are not supposed to send anything else.
    async fn idle_until_bye(&self, conn: &mut Connection) {
        loop {
            match conn.recv_idle().await {
                Ok(Incoming::Bye) => {
                    debug!("listener sent bye");
                    break;
                }
                Ok(Incoming::Frame(_)) => {
                    warn!("unexpected frame from listener, ignoring");
                }
                Err(WireError::PeerGone) => break,
                Err(error) => {
                    debug!(%error, "listener connection error");
                    break;
                }
            }
        }
    }

    async fn artifact(&self, conn: &mut Connection, job_id: &str, index: usize) -> Result<()> {
        let Some(job) = self.registry.find_job(job_id) else {
            conn.send_error("Job not found").await?;
            return Ok(());
        };
        match job.get_artifact(index) {
            Some(entry) => {
                conn.send(&ArtifactReply {
                    artifact_type: entry.0,
                    artifact: entry.1.clone(),
                })
                .await?;
                Ok(())
            }
            None => {
                conn.send_error("Artifact not found").await?;
                Ok(())
            }
        }
    }

    /// Forwards a user control action to the job's worker connection.
    async fn forward_action(
        &self,
        conn: &mut Connection,
        job_id: &str,
        action: JobAction,
    ) -> Result<()> {
        let worker = self.registry.get(job_id).and_then(|live| live.worker());
        match worker {
            Some(worker) => {
                worker.send(&ActionFrame { action }).await?;
                conn.send(&serde_json::json!({"ok": true})).await?;
                Ok(())
            }
            None => {
                conn.send_error("Job not running").await?;
                Ok(())
            }
        }
    }

    /// Serves a worker connection: push the record, then merge its update
    /// stream until it says bye.
    async fn handle_worker(&self, conn: &mut Connection, job_id: &str) -> Result<()> {
        let Some(live) = self.registry.get(job_id) else {
            conn.send_error("Job not found").await?;
            return Ok(());
        };
        debug!(jid = %job_id, "worker bound, sending job info");
        conn.send(&live.snapshot()).await?;
        live.set_worker(conn.write_handle());

        loop {
            match conn.recv_idle().await {
                Ok(Incoming::Bye) => {
                    info!(jid = %job_id, "worker sent bye");
                    break;
                }
                Ok(Incoming::Frame(frame)) => {
                    match serde_json::from_value::<JobPatch>(frame) {
                        Ok(patch) => live.update(patch),
                        Err(error) => warn!(%error, "unknown frame from worker, ignoring"),
                    }
                }
                Err(error) => {
                    warn!(jid = %job_id, %error, "worker connection lost");
                    break;
                }
            }
        }

        live.clear_worker();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task::ArtifactType;
    use crate::wire::frames;
    use serde_json::json;

    async fn start_master(dir: &std::path::Path) -> (Arc<Master>, std::net::SocketAddr) {
        let config = Arc::new(Config::load(dir).unwrap());
        let master = Master::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let run = master.clone();
        tokio::spawn(async move { run.run(listener, CancellationToken::new()).await });
        (master, addr)
    }

    async fn connect(addr: std::net::SocketAddr) -> Connection {
        let stream = TcpStream::connect(addr).await.unwrap();
        Connection::from_tcp(stream, false)
    }

    // S2: a submit with no registered slaves is rejected and rolled back.
    #[tokio::test]
    async fn test_submit_without_slaves_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let (master, addr) = start_master(dir.path()).await;

        let mut conn = connect(addr).await;
        conn.send(&json!({
            "role": "user",
            "action": "submit",
            "job": {"job_type": "youtube", "media": {"source": "x"}},
        }))
        .await
        .unwrap();

        match conn.recv().await {
            Err(WireError::Remote(message)) => assert_eq!(message, "No slaves available"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(master.registry().is_empty());
        // No dump was written either.
        let dumps = std::fs::read_dir(dir.path().join("media")).unwrap().count();
        assert_eq!(dumps, 0);
    }

    // S1 (placement half): with an idle slave connected, a submit is acked
    // with a created job, and the slave sees the submit command.
    #[tokio::test]
    async fn test_submit_with_scripted_slave() {
        let dir = tempfile::tempdir().unwrap();
        let (master, addr) = start_master(dir.path()).await;

        // A hand-rolled slave: register, then answer the submit with a pid.
        let mut slave = connect(addr).await;
        slave
            .send(&json!({"role": "slave", "slaveId": "s-1"}))
            .await
            .unwrap();
        let slave_task = tokio::spawn(async move {
            let frame = slave.recv().await.unwrap();
            assert_eq!(frame["action"], "submit");
            let job_id = frame["jobId"].as_str().unwrap().to_owned();
            slave
                .send(&json!({"action": "submit", "jobId": job_id, "pid": 4242}))
                .await
                .unwrap();
            (slave, job_id)
        });

        // Give the registration a moment to land in the pool.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut user = connect(addr).await;
        user.send(&json!({
            "role": "user",
            "action": "submit",
            "job": {"job_type": "youtube", "media": {"source": "x"}},
        }))
        .await
        .unwrap();

        let job = user.recv().await.unwrap();
        let jid = job["jid"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(jid).is_ok());
        assert_eq!(job["status"], "created");
        assert!(job["created_at"].as_f64().unwrap() > 0.0);

        let (_slave, submitted_jid) = slave_task.await.unwrap();
        assert_eq!(submitted_jid, jid);
        assert!(master.registry().get(jid).is_some());
    }

    // S4: a late-joining listener first gets the current snapshot, then the
    // stream tail frame-for-frame.
    #[tokio::test]
    async fn test_query_snapshot_then_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (master, addr) = start_master(dir.path()).await;

        let live = master.registry().insert(Job::new(crate::types::job::JobRequest {
            job_type: crate::types::job::JobType::Youtube,
            media: crate::types::job::Media {
                source: "x".into(),
                metadata: Default::default(),
            },
        }));
        live.update(JobPatch {
            status: Some(JobStatus::Running),
            message: Some("separating".into()),
            ..Default::default()
        });

        let mut user = connect(addr).await;
        user.send(&json!({"role": "user", "action": "query", "jobId": live.jid}))
            .await
            .unwrap();

        let snapshot = user.recv().await.unwrap();
        assert_eq!(snapshot["status"], "running");
        assert_eq!(snapshot["message"], "separating");

        live.update(JobPatch {
            message: Some("aligning".into()),
            ..Default::default()
        });
        let update = user.recv().await.unwrap();
        assert_eq!(update["message"], "aligning");

        user.send(&frames::bye()).await.unwrap();
    }

    #[tokio::test]
    async fn test_artifact_by_index_and_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let (master, addr) = start_master(dir.path()).await;

        let mut job = Job::new(crate::types::job::JobRequest {
            job_type: crate::types::job::JobType::Local,
            media: crate::types::job::Media {
                source: "song.mp4".into(),
                metadata: Default::default(),
            },
        });
        job.add_artifact(ArtifactType::Audio, "song_vocals.wav".into(), Some("Vocals"));
        let jid = job.jid.clone();
        master.registry().insert(job);

        let mut user = connect(addr).await;
        user.send(&json!({"role": "user", "action": "artifact", "jobId": jid, "artifact": 0}))
            .await
            .unwrap();
        let reply = user.recv().await.unwrap();
        assert_eq!(reply["artifact_type"], "audio");
        assert_eq!(reply["artifact"], "song_vocals.wav");

        let mut user = connect(addr).await;
        user.send(&json!({"role": "user", "action": "artifact", "jobId": jid, "artifact": 7}))
            .await
            .unwrap();
        assert!(matches!(user.recv().await, Err(WireError::Remote(_))));
    }

    // A worker binds, receives its job, and its patches fan out to a
    // listener in order.
    #[tokio::test]
    async fn test_worker_updates_reach_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let (master, addr) = start_master(dir.path()).await;

        let live = master.registry().insert(Job::new(crate::types::job::JobRequest {
            job_type: crate::types::job::JobType::Youtube,
            media: crate::types::job::Media {
                source: "x".into(),
                metadata: Default::default(),
            },
        }));
        let jid = live.jid.clone();

        let mut listener = connect(addr).await;
        listener
            .send(&json!({"role": "user", "action": "query", "jobId": jid}))
            .await
            .unwrap();
        let snapshot = listener.recv().await.unwrap();
        assert_eq!(snapshot["status"], "pending");

        let mut worker = connect(addr).await;
        worker
            .send(&json!({"role": "worker", "jobId": jid}))
            .await
            .unwrap();
        let job = worker.recv().await.unwrap();
        assert_eq!(job["jid"], jid.as_str());

        worker
            .send(&json!({"status": "running", "message": "downloading"}))
            .await
            .unwrap();
        let update = listener.recv().await.unwrap();
        assert_eq!(update["status"], "running");
        assert_eq!(update["message"], "downloading");

        worker
            .send(&json!({"tasks": {"t-1": {"name": "Audio Downloading", "status": "running"}}}))
            .await
            .unwrap();
        let update = listener.recv().await.unwrap();
        assert_eq!(update["tasks"]["t-1"]["status"], "running");

        worker.send(&frames::bye()).await.unwrap();
    }

    // S3: a worker that goes silent past min_job_response_time gets
    // terminated through its slave and the job ends interrupted, on disk
    // too.
    #[tokio::test]
    async fn test_watchdog_interrupts_silent_worker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.ini"),
            "[scheduler]\nmin_job_response_time = 1\n",
        )
        .unwrap();
        let (master, addr) = start_master(dir.path()).await;

        let mut slave = connect(addr).await;
        slave
            .send(&json!({"role": "slave", "slaveId": "s-1"}))
            .await
            .unwrap();
        let slave_task = tokio::spawn(async move {
            // Ack the submit, then sit silent until the terminate arrives.
            let submit = slave.recv().await.unwrap();
            let job_id = submit["jobId"].as_str().unwrap().to_owned();
            slave
                .send(&json!({"action": "submit", "jobId": job_id, "pid": 77}))
                .await
                .unwrap();

            let terminate = slave.recv().await.unwrap();
            assert_eq!(terminate["action"], "terminate");
            assert_eq!(terminate["jobId"], job_id.as_str());
            slave
                .send(&json!({"action": "update", "jobId": job_id, "returncode": -15}))
                .await
                .unwrap();
            job_id
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut user = connect(addr).await;
        user.send(&json!({
            "role": "user",
            "action": "submit",
            "job": {"job_type": "youtube", "media": {"source": "x"}},
        }))
        .await
        .unwrap();
        let job = user.recv().await.unwrap();
        let jid = job["jid"].as_str().unwrap().to_owned();

        // The guard fires within a couple of ticks of the threshold.
        let job_id = tokio::time::timeout(std::time::Duration::from_secs(10), slave_task)
            .await
            .expect("watchdog did not fire")
            .unwrap();
        assert_eq!(job_id, jid);

        // The exit report finalizes the record and its dump.
        let dump_path = dir.path().join("media").join(format!("{jid}.json"));
        for _ in 0..100 {
            if dump_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let dumped = Job::load(&dump_path).unwrap();
        assert_eq!(dumped.status, JobStatus::Interrupted);
        assert!(dumped.is_process_exited);
        assert!(dumped.finished_at.is_some());
        assert!(master.registry().get(&jid).unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_unknown_job_worker_bind_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (_master, addr) = start_master(dir.path()).await;

        let mut worker = connect(addr).await;
        worker
            .send(&json!({"role": "worker", "jobId": "no-such-job"}))
            .await
            .unwrap();
        assert!(matches!(worker.recv().await, Err(WireError::Remote(_))));
    }
}
