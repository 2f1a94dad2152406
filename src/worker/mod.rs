pub mod binder;
pub mod job;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::types::job::{Job, JobRequest, JobStatus, JobType, Media};

/// Runs one scheduler-owned job to completion and reports the outcome.
pub async fn run_remote(config: Arc<Config>, job_id: &str) -> Result<JobStatus> {
    let (worker_job, binder) = binder::bind_scheduler(&config, job_id).await?;

    // The slave terminates with SIGTERM; treat it as a stop action so the
    // pipeline interrupts cooperatively instead of dying mid-write.
    #[cfg(unix)]
    {
        let job = worker_job.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                job.post_action(crate::types::job::JobAction::Stop);
            }
        });
    }

    let job_type = worker_job.snapshot().job_type;
    let defs = crate::stages::build_pipeline(job_type);
    let pipeline = Pipeline::build(config, worker_job.clone(), defs);
    pipeline.run().await;

    let outcome = worker_job.finish();
    info!(jid = %worker_job.jid(), ?outcome, "job finished");

    if let Err(error) = binder.await {
        error!(%error, "binder task failed");
    }
    Ok(outcome)
}

/// Runs a job constructed locally from a URL or file path, without a
/// scheduler: progress goes to the terminal, actions come from stdin.
pub async fn run_local(
    config: Arc<Config>,
    url: Option<String>,
    filepath: Option<String>,
) -> Result<JobStatus> {
    let request = match (url, filepath) {
        (Some(url), _) => JobRequest {
            job_type: JobType::Youtube,
            media: Media {
                source: url,
                metadata: Default::default(),
            },
        },
        (None, Some(path)) => JobRequest {
            job_type: JobType::Local,
            media: Media {
                source: path,
                metadata: Default::default(),
            },
        },
        (None, None) => anyhow::bail!("either a url or a filepath is required"),
    };

    let job = Job::new(request);
    let job_type = job.job_type;
    let (worker_job, echo) = binder::bind_local(job);

    let defs = crate::stages::build_pipeline(job_type);
    let pipeline = Pipeline::build(config, worker_job.clone(), defs);
    pipeline.run().await;

    let outcome = worker_job.finish();
    let _ = echo.await;

    println!();
    println!("Job finished: {outcome:?}");
    Ok(outcome)
}
