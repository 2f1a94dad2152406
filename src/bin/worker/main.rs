mod args;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::args::Args;
use karaforge::config::Config;
use karaforge::pipeline::{child, daemon};
use karaforge::types::job::JobStatus;
use karaforge::worker;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let work_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(error) => {
            eprintln!("cannot determine working directory: {error}");
            return ExitCode::FAILURE;
        }
    };
    let config = match Config::load(&work_dir) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("failed to load config: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Stdout carries the event protocol in stage mode and progress echoes
    // in local mode; logs always go to stderr.
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_writer(std::io::stderr)
        .init();

    if let Some(stage) = &args.stage {
        return match child::run_stage(config.clone(), stage).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "stage body crashed");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(stage) = &args.stage_daemon {
        return match daemon::serve_stage(config.clone(), stage).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "stage daemon failed");
                ExitCode::FAILURE
            }
        };
    }

    if args.daemon {
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(error) = signal::ctrl_c().await {
                    warn!(%error, "something strange with ctrl-c handling!");
                }
                cancel.cancel();
            });
        }
        println!("Press Ctrl+C to stop the daemon processes");
        return match daemon::run_daemons(config.clone(), cancel).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "daemon supervisor failed");
                ExitCode::FAILURE
            }
        };
    }

    let outcome = if let Some(job_id) = &args.job_id {
        worker::run_remote(config, job_id).await
    } else {
        worker::run_local(config, args.url.clone(), args.filepath.clone()).await
    };

    match outcome {
        Ok(JobStatus::Completed) => ExitCode::SUCCESS,
        Ok(status) => {
            warn!(?status, "pipeline did not complete");
            ExitCode::FAILURE
        }
        Err(error) => {
            error!(%error, "worker failed");
            ExitCode::FAILURE
        }
    }
}
