use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::SchedulerError;
use crate::wire::frames::{SlaveCommand, SlaveReport};
use crate::wire::{Connection, Incoming, WriteHandle};

/// How long a submit waits for the slave's pid ack before rolling back.
const SUBMIT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a worker process running on a remote host, fed by the slave's
/// `update` reports. Mirrors a local child-process handle: poll, wait,
/// terminate.
#[derive(Clone)]
pub struct RemoteProcess {
    pub pid: u32,
    job_id: String,
    slave: WriteHandle,
    exit: watch::Receiver<Option<i32>>,
}

impl RemoteProcess {
    /// Returns the exit code if the process has terminated.
    pub fn poll(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Waits for the process to terminate and returns its exit code.
    pub async fn wait(&mut self) -> i32 {
        loop {
            if let Some(returncode) = *self.exit.borrow() {
                return returncode;
            }
            if self.exit.changed().await.is_err() {
                // Slave gone without a report; treated as an abnormal exit.
                return -1;
            }
        }
    }

    /// Asks the slave to SIGTERM the worker. The exit still arrives through
    /// the normal update path.
    pub async fn terminate(&self) {
        if self.poll().is_some() {
            return;
        }
        let command = SlaveCommand::Terminate {
            job_id: self.job_id.clone(),
        };
        if self.slave.send(&command).await.is_err() {
            warn!(job_id = %self.job_id, "slave writer closed, cannot terminate");
        }
    }
}

#[derive(Default)]
struct BinderTables {
    submit_events: HashMap<String, oneshot::Sender<Option<u32>>>,
    processes: HashMap<String, watch::Sender<Option<i32>>>,
}

/// Master-side binding of one registered host slave: its control-channel
/// writer, pending submit acks, and live process table.
pub struct SlaveBinder {
    pub slave_id: String,
    writer: WriteHandle,
    working: AtomicBool,
    tables: Mutex<BinderTables>,
}

impl SlaveBinder {
    fn new(slave_id: String, writer: WriteHandle) -> SlaveBinder {
        SlaveBinder {
            slave_id,
            writer,
            working: AtomicBool::new(false),
            tables: Mutex::new(BinderTables::default()),
        }
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Sends a submit command and waits (bounded) for the pid ack.
    pub async fn submit(&self, job_id: &str) -> Result<RemoteProcess, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.tables
            .lock()
            .unwrap()
            .submit_events
            .insert(job_id.to_owned(), tx);

        let command = SlaveCommand::Submit {
            job_id: job_id.to_owned(),
        };
        if self.writer.send(&command).await.is_err() {
            self.tables.lock().unwrap().submit_events.remove(job_id);
            return Err(SchedulerError::SubmitFailed(job_id.to_owned()));
        }

        let ack = timeout(SUBMIT_ACK_TIMEOUT, rx).await;
        self.tables.lock().unwrap().submit_events.remove(job_id);

        match ack {
            Ok(Ok(Some(pid))) => {
                let (exit_tx, exit_rx) = watch::channel(None);
                self.tables
                    .lock()
                    .unwrap()
                    .processes
                    .insert(job_id.to_owned(), exit_tx);
                Ok(RemoteProcess {
                    pid,
                    job_id: job_id.to_owned(),
                    slave: self.writer.clone(),
                    exit: exit_rx,
                })
            }
            Ok(Ok(None)) | Ok(Err(_)) => Err(SchedulerError::SubmitFailed(job_id.to_owned())),
            Err(_) => Err(SchedulerError::SubmitTimeout),
        }
    }

    fn handle_report(&self, report: SlaveReport) {
        match report {
            SlaveReport::Submit { job_id, pid } => {
                let sender = self.tables.lock().unwrap().submit_events.remove(&job_id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(pid);
                    }
                    None => warn!(%job_id, "submit ack for a job not being submitted"),
                }
            }
            SlaveReport::Update { job_id, returncode } => {
                let process = self.tables.lock().unwrap().processes.remove(&job_id);
                match process {
                    Some(exit) => {
                        let _ = exit.send(Some(returncode));
                    }
                    None => warn!(%job_id, "exit report for a job not running here"),
                }
            }
            SlaveReport::Working { working } => {
                self.working.store(working, Ordering::SeqCst);
            }
        }
    }

    /// Fails every pending submit and completes every live process with an
    /// abnormal exit code. Called when the control connection is lost.
    fn shut_down(&self) {
        let mut tables = self.tables.lock().unwrap();
        for (_, sender) in tables.submit_events.drain() {
            let _ = sender.send(None);
        }
        for (_, exit) in tables.processes.drain() {
            let _ = exit.send(Some(-1));
        }
    }
}

#[derive(Default)]
struct PoolInner {
    slaves: Vec<Arc<SlaveBinder>>,
    cursor: usize,
}

/// The registered host slaves, with round-robin placement over idle ones.
#[derive(Default)]
pub struct SlavePool {
    inner: Mutex<PoolInner>,
}

impl SlavePool {
    pub fn new() -> SlavePool {
        SlavePool::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the next idle slave after the round-robin cursor; if every
    /// slave is busy, the next one in rotation is taken anyway.
    fn pick(&self) -> Result<Arc<SlaveBinder>, SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.slaves.is_empty() {
            return Err(SchedulerError::NoSlavesAvailable);
        }
        let len = inner.slaves.len();
        let start = inner.cursor % len;
        let offset = (0..len)
            .find(|i| !inner.slaves[(start + i) % len].is_working())
            .unwrap_or(0);
        let index = (start + offset) % len;
        inner.cursor = (index + 1) % len;
        Ok(inner.slaves[index].clone())
    }

    /// Places a job on a slave and returns the remote process handle.
    pub async fn submit(&self, job_id: &str) -> Result<RemoteProcess, SchedulerError> {
        let slave = self.pick()?;
        info!(job_id, slave_id = %slave.slave_id, "submitting job to slave");
        slave.submit(job_id).await
    }

    fn add(&self, slave: Arc<SlaveBinder>) {
        self.inner.lock().unwrap().slaves.push(slave);
    }

    fn remove(&self, slave: &Arc<SlaveBinder>) {
        slave.shut_down();
        let mut inner = self.inner.lock().unwrap();
        inner
            .slaves
            .retain(|other| !Arc::ptr_eq(other, slave));
        if !inner.slaves.is_empty() {
            inner.cursor %= inner.slaves.len();
        } else {
            inner.cursor = 0;
        }
    }

    /// Registers a slave and serves its control connection until it drops.
    pub async fn serve(&self, slave_id: String, mut conn: Connection) {
        let binder = Arc::new(SlaveBinder::new(slave_id, conn.write_handle()));
        info!(slave_id = %binder.slave_id, peer = %conn.peer(), "slave registered");
        self.add(binder.clone());

        loop {
            match conn.recv_idle().await {
                Ok(Incoming::Bye) => {
                    info!(slave_id = %binder.slave_id, "slave sent bye");
                    break;
                }
                Ok(Incoming::Frame(frame)) => {
                    match serde_json::from_value::<SlaveReport>(frame) {
                        Ok(report) => binder.handle_report(report),
                        Err(error) => warn!(%error, "unknown frame from slave, ignoring"),
                    }
                }
                Err(error) => {
                    error!(slave_id = %binder.slave_id, %error, "slave connection lost");
                    break;
                }
            }
        }

        self.remove(&binder);
        conn.close().await;
    }
}
