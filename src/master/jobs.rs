use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use super::slaves::RemoteProcess;
use crate::config::Config;
use crate::now_ts;
use crate::types::job::{Job, JobPatch, JobStatus};
use crate::wire::WriteHandle;

/// Upper bound on how long the watchdog sleeps between `last_update`
/// inspections.
const GUARD_TICK_MAX: Duration = Duration::from_secs(60);

struct Listener {
    id: usize,
    handle: WriteHandle,
}

#[derive(Default)]
struct LiveInner {
    listeners: Vec<Listener>,
    process: Option<RemoteProcess>,
    worker: Option<WriteHandle>,
}

/// A job held by the master: the record itself, its update listeners, the
/// attached remote process, and the worker connection used for forwarding
/// control actions.
pub struct LiveJob {
    pub jid: String,
    config: Arc<Config>,
    job: Mutex<Job>,
    inner: Mutex<LiveInner>,
}

impl LiveJob {
    pub fn new(job: Job, config: Arc<Config>) -> Arc<LiveJob> {
        Arc::new(LiveJob {
            jid: job.jid.clone(),
            config,
            job: Mutex::new(job),
            inner: Mutex::new(LiveInner::default()),
        })
    }

    /// Wire snapshot of the current record.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&*self.job.lock().unwrap()).expect("job serializes")
    }

    pub fn job(&self) -> Job {
        self.job.lock().unwrap().clone()
    }

    /// Merges a patch and broadcasts the refreshed snapshot to listeners.
    pub fn update(&self, patch: JobPatch) {
        self.job.lock().unwrap().apply(patch);
        self.broadcast();
    }

    /// Pushes the current snapshot to every listener, dropping the ones
    /// whose connections cannot keep up.
    fn broadcast(&self) {
        let frame = self.snapshot();
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|listener| {
            let delivered = listener.handle.push(frame.clone());
            if !delivered {
                warn!(jid = %self.jid, "dropping listener that cannot keep up");
            }
            delivered
        });
    }

    /// Registers a listener and immediately pushes the current snapshot.
    /// Listeners are observers only: their loss never affects the job.
    pub fn add_listener(&self, id: usize, handle: WriteHandle) {
        if !handle.push(self.snapshot()) {
            warn!(jid = %self.jid, "failed to push initial snapshot to listener");
            return;
        }
        self.inner
            .lock()
            .unwrap()
            .listeners
            .push(Listener { id, handle });
    }

    pub fn remove_listener(&self, id: usize) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .retain(|listener| listener.id != id);
    }

    /// Registers the worker connection for control-action forwarding.
    pub fn set_worker(&self, handle: WriteHandle) {
        self.inner.lock().unwrap().worker = Some(handle);
    }

    pub fn clear_worker(&self) {
        self.inner.lock().unwrap().worker = None;
    }

    pub fn worker(&self) -> Option<WriteHandle> {
        self.inner.lock().unwrap().worker.clone()
    }

    fn process(&self) -> Option<RemoteProcess> {
        self.inner.lock().unwrap().process.clone()
    }

    /// Attaches the remote process after a successful submit, marks the job
    /// created, and starts the guard task that watches responsiveness and
    /// finalizes the record on exit.
    pub fn attach(self: &Arc<Self>, process: RemoteProcess) {
        info!(jid = %self.jid, pid = process.pid, "process attached to job");
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.process.is_none(), "process already attached");
            inner.process = Some(process.clone());
        }
        self.update(JobPatch {
            status: Some(JobStatus::Created),
            started_at: Some(now_ts()),
            ..Default::default()
        });

        let guard = self.clone();
        tokio::spawn(async move { guard.process_guard(process).await });
    }

    /// Watchdog: interrupts the job when the worker stays silent past
    /// `min_job_response_time`. Finalization happens here too, strictly
    /// after any in-flight interrupt sequence, so a watchdog kill can
    /// never be misread as an abnormal exit.
    async fn process_guard(self: Arc<Self>, mut process: RemoteProcess) {
        info!(jid = %self.jid, "starting process guard");
        let min_response = self.config.min_job_response_time as f64;
        let tick = Duration::from_secs(self.config.min_job_response_time.max(1))
            .min(GUARD_TICK_MAX);
        loop {
            if process.poll().is_some() {
                break;
            }
            let last_update = self.job.lock().unwrap().last_update;
            if now_ts() - last_update > min_response {
                warn!(jid = %self.jid, "worker exceeded minimum response time, interrupting");
                self.interrupt().await;
            }
            tokio::select! {
                _ = process.wait() => break,
                _ = sleep(tick) => {}
            }
        }
        let returncode = process.wait().await;
        info!(jid = %self.jid, returncode, "worker process exited");
        self.finalize();
    }

    /// Forcefully interrupts the attached process and waits for it to die.
    pub async fn interrupt(&self) {
        let Some(mut process) = self.process() else {
            warn!(jid = %self.jid, "interrupt requested with no process attached");
            return;
        };
        self.update(JobPatch::status(JobStatus::Interrupting));
        process.terminate().await;
        process.wait().await;
        self.update(JobPatch {
            status: Some(JobStatus::Interrupted),
            is_process_exited: Some(true),
            ..Default::default()
        });
    }

    /// Process-exit cleanup: sweep the record, dump it, broadcast the final
    /// state.
    fn finalize(&self) {
        self.inner.lock().unwrap().process = None;
        {
            let mut job = self.job.lock().unwrap();
            job.done();
            if let Err(error) = job.dump(&self.config.media_path) {
                error!(jid = %self.jid, %error, "failed to dump job");
            }
        }
        self.broadcast();
    }

    /// Finished means evictable: terminal, or no live process behind a
    /// non-queued status (for example a record reloaded from disk).
    pub fn is_finished(&self) -> bool {
        let status = self.job.lock().unwrap().status;
        if matches!(
            status,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Created
        ) {
            return false;
        }
        match self.process() {
            None => true,
            Some(process) => process.poll().is_some(),
        }
    }
}

/// The master's in-memory job table, reloaded from `<media_path>/*.json`
/// at startup and bounded by `max_daemon_jobs` via finished-job eviction.
pub struct JobRegistry {
    config: Arc<Config>,
    jobs: Mutex<HashMap<String, Arc<LiveJob>>>,
    global_listeners: Mutex<Vec<(usize, WriteHandle)>>,
    next_listener: AtomicUsize,
}

impl JobRegistry {
    pub fn load(config: Arc<Config>) -> JobRegistry {
        let mut jobs = HashMap::new();
        let entries = match std::fs::read_dir(&config.media_path) {
            Ok(entries) => entries,
            Err(error) => {
                error!(%error, "cannot read media path, starting empty");
                return JobRegistry::empty(config);
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Job::load(&path) {
                Ok(job) => {
                    info!(jid = %job.jid, "loaded job from disk");
                    jobs.insert(job.jid.clone(), LiveJob::new(job, config.clone()));
                }
                Err(error) => {
                    error!(path = %path.display(), %error, "error loading job dump");
                }
            }
        }
        JobRegistry {
            config,
            jobs: Mutex::new(jobs),
            global_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicUsize::new(0),
        }
    }

    fn empty(config: Arc<Config>) -> JobRegistry {
        JobRegistry {
            config,
            jobs: Mutex::new(HashMap::new()),
            global_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicUsize::new(0),
        }
    }

    pub fn listener_id(&self) -> usize {
        self.next_listener.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, jid: &str) -> Option<Arc<LiveJob>> {
        self.jobs.lock().unwrap().get(jid).cloned()
    }

    /// The record from memory, or from its dump on disk.
    pub fn find_job(&self, jid: &str) -> Option<Job> {
        if let Some(live) = self.get(jid) {
            return Some(live.job());
        }
        let path = self.config.media_path.join(format!("{jid}.json"));
        path.exists().then(|| Job::load(&path).ok()).flatten()
    }

    /// Inserts a fresh job, evicting one finished job beyond the cap, and
    /// attaches every all-jobs listener to it.
    pub fn insert(&self, job: Job) -> Arc<LiveJob> {
        self.evict_finished();
        let live = LiveJob::new(job, self.config.clone());
        self.jobs
            .lock()
            .unwrap()
            .insert(live.jid.clone(), live.clone());
        for (id, handle) in self.global_listeners.lock().unwrap().iter() {
            live.add_listener(*id, handle.clone());
        }
        live
    }

    /// Rolls back a job that could not be placed (the disk copy, if any,
    /// is untouched).
    pub fn remove(&self, jid: &str) {
        self.jobs.lock().unwrap().remove(jid);
    }

    fn evict_finished(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.len() < self.config.max_daemon_jobs {
            return;
        }
        let finished = jobs
            .iter()
            .find(|(_, live)| live.is_finished())
            .map(|(jid, _)| jid.clone());
        if let Some(jid) = finished {
            jobs.remove(&jid);
            info!(%jid, "evicted finished job from memory");
        }
    }

    /// Registers an all-jobs listener on every current and future job.
    pub fn add_global_listener(&self, id: usize, handle: WriteHandle) {
        self.global_listeners
            .lock()
            .unwrap()
            .push((id, handle.clone()));
        for live in self.jobs.lock().unwrap().values() {
            live.add_listener(id, handle.clone());
        }
    }

    pub fn remove_global_listener(&self, id: usize) {
        self.global_listeners
            .lock()
            .unwrap()
            .retain(|(other, _)| *other != id);
        for live in self.jobs.lock().unwrap().values() {
            live.remove_listener(id);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
