use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::wire::frames::{Hello, SlaveCommand, SlaveReport};
use crate::wire::{Connection, Incoming, WriteHandle};

/// Delay between reconnect attempts to the master.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A host-slave: one control connection to the master, one forked worker
/// process per submitted job. Stateless across restarts — it re-registers
/// under a fresh id and leaves dangling children to report themselves.
pub struct HostSlave {
    config: Arc<Config>,
    worker_binary: PathBuf,
    /// jobId → pid of the live child, for terminate routing.
    children: Arc<Mutex<HashMap<String, u32>>>,
}

/// The worker binary normally sits next to the current executable;
/// otherwise PATH resolution applies.
pub fn default_worker_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("kara-worker");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("kara-worker")
}

impl HostSlave {
    pub fn new(config: Arc<Config>) -> HostSlave {
        HostSlave::with_worker_binary(config, default_worker_binary())
    }

    pub fn with_worker_binary(config: Arc<Config>, worker_binary: PathBuf) -> HostSlave {
        HostSlave {
            config,
            worker_binary,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connects, serves, and reconnects until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            if let Err(error) = self.serve_once(&cancel).await {
                error!(%error, "connection to scheduler failed");
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            info!("retrying in {} seconds...", RECONNECT_DELAY.as_secs());
            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// One registration lifetime: connect, announce, serve commands until
    /// the connection drops or we are cancelled.
    pub async fn serve_once(&self, cancel: &CancellationToken) -> Result<()> {
        let slave_id = Uuid::new_v4().to_string();
        let addr = (
            self.config.scheduler_host.as_str(),
            self.config.scheduler_port,
        );
        info!(%slave_id, host = addr.0, port = addr.1, "connecting to scheduler");
        let stream = TcpStream::connect(addr).await?;
        let mut conn = Connection::from_tcp(stream, false);

        conn.send(&Hello::Slave {
            slave_id: slave_id.clone(),
        })
        .await?;

        loop {
            let incoming = tokio::select! {
                incoming = conn.recv_idle() => incoming,
                _ = cancel.cancelled() => break,
            };
            match incoming {
                Ok(Incoming::Bye) => {
                    info!("scheduler sent bye");
                    break;
                }
                Ok(Incoming::Frame(frame)) => {
                    match serde_json::from_value::<SlaveCommand>(frame) {
                        Ok(SlaveCommand::Submit { job_id }) => {
                            self.start_worker(job_id, conn.write_handle());
                        }
                        Ok(SlaveCommand::Terminate { job_id }) => self.terminate(&job_id),
                        Err(error) => warn!(%error, "unknown frame from scheduler, ignoring"),
                    }
                }
                Err(error) => {
                    error!(%error, "error receiving from scheduler");
                    break;
                }
            }
        }

        conn.close().await;
        Ok(())
    }

    /// Forks a worker for the job, acks with its pid, and reports the exit
    /// through the normal update path.
    fn start_worker(&self, job_id: String, writer: WriteHandle) {
        let children = self.children.clone();
        let binary = self.worker_binary.clone();
        tokio::spawn(async move {
            let _ = writer.send(&SlaveReport::Working { working: true }).await;

            // No kill-on-drop: a slave restart leaves children dangling and
            // they report themselves through their own connections.
            let spawned = Command::new(&binary)
                .arg("--jobId")
                .arg(&job_id)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(error) => {
                    error!(%job_id, %error, "error spawning worker process");
                    let _ = writer
                        .send(&SlaveReport::Submit {
                            job_id: job_id.clone(),
                            pid: None,
                        })
                        .await;
                    let _ = writer.send(&SlaveReport::Working { working: false }).await;
                    return;
                }
            };

            let pid = child.id().unwrap_or_default();
            info!(%job_id, pid, "spawned worker process");
            children.lock().unwrap().insert(job_id.clone(), pid);
            let _ = writer
                .send(&SlaveReport::Submit {
                    job_id: job_id.clone(),
                    pid: Some(pid),
                })
                .await;

            let returncode = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(error) => {
                    error!(%job_id, %error, "error waiting for worker process");
                    -1
                }
            };

            children.lock().unwrap().remove(&job_id);
            let _ = writer
                .send(&SlaveReport::Update {
                    job_id: job_id.clone(),
                    returncode,
                })
                .await;
            let _ = writer.send(&SlaveReport::Working { working: false }).await;
        });
    }

    /// SIGTERMs the worker for the job; its exit is reported by the normal
    /// wait path.
    fn terminate(&self, job_id: &str) {
        let pid = self.children.lock().unwrap().get(job_id).copied();
        match pid {
            Some(pid) => {
                info!(%job_id, pid, "terminating worker process");
                #[cfg(unix)]
                // Cooperative first: the worker traps SIGTERM and shuts its
                // pipeline down before exiting.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                #[cfg(not(unix))]
                let _ = pid;
            }
            None => warn!(%job_id, "no worker process found for job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Boots a scripted master and a slave pointed at it, with the given
    /// "worker" binary.
    async fn harness(worker: &str) -> (Connection, CancellationToken, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.ini"),
            format!("[scheduler]\nhost = 127.0.0.1\nport = {port}\n"),
        )
        .unwrap();
        let config = Arc::new(Config::load(dir.path()).unwrap());

        let slave = HostSlave::with_worker_binary(config, PathBuf::from(worker));
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _ = slave.serve_once(&serve_cancel).await;
            // Keep the tempdir alive for the run.
            drop(dir);
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::from_tcp(stream, true);
        let hello = conn.recv().await.unwrap();
        assert_eq!(hello["role"], "slave");
        assert!(uuid::Uuid::parse_str(hello["slaveId"].as_str().unwrap()).is_ok());
        (conn, cancel, task)
    }

    #[tokio::test]
    async fn test_submit_reports_pid_and_exit() {
        let (mut master, cancel, task) = harness("true").await;

        master
            .send(&json!({"action": "submit", "jobId": "j-1"}))
            .await
            .unwrap();

        let working = master.recv().await.unwrap();
        assert_eq!(working["action"], "slave");
        assert_eq!(working["working"], true);

        let ack = master.recv().await.unwrap();
        assert_eq!(ack["action"], "submit");
        assert_eq!(ack["jobId"], "j-1");
        assert!(ack["pid"].as_u64().is_some());

        // `true` exits immediately with 0.
        let update = master.recv().await.unwrap();
        assert_eq!(update["action"], "update");
        assert_eq!(update["jobId"], "j-1");
        assert_eq!(update["returncode"], 0);

        let idle = master.recv().await.unwrap();
        assert_eq!(idle["working"], false);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_spawn_reports_null_pid() {
        let (mut master, cancel, task) = harness("/nonexistent/kara-worker").await;

        master
            .send(&json!({"action": "submit", "jobId": "j-2"}))
            .await
            .unwrap();

        let working = master.recv().await.unwrap();
        assert_eq!(working["working"], true);

        let ack = master.recv().await.unwrap();
        assert_eq!(ack["action"], "submit");
        assert!(ack["pid"].is_null());

        let idle = master.recv().await.unwrap();
        assert_eq!(idle["working"], false);

        cancel.cancel();
        task.await.unwrap();
    }
}
