use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use karaforge::config::Config;
use karaforge::master::Master;

#[tokio::main]
async fn main() -> ExitCode {
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

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            info!("shutting down");
            cancel.cancel();
        });
    }

    let addr = (config.scheduler_host.clone(), config.scheduler_port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        }
    };

    let master = Master::new(config);
    match master.run(listener, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        }
    }
}
