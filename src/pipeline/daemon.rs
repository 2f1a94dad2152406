use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::stage::StageContext;
use crate::config::Config;
use crate::wire::Connection;

/// Serves one stage behind its well-known socket: preload once, then an
/// accept loop answering sequential requests with the same event protocol
/// a fresh subprocess would speak. Entry point of
/// `kara-worker --stage-daemon <name>`.
#[cfg(unix)]
pub async fn serve_stage(config: Arc<Config>, stage_name: &str) -> Result<()> {
    let mut stage = crate::stages::create(&config, stage_name)
        .ok_or_else(|| anyhow::anyhow!("unknown stage: {stage_name}"))?;

    let dir = config.daemon_dir();
    std::fs::create_dir_all(&dir)?;
    let socket = dir.join(format!("{stage_name}.sock"));
    // A stale socket from a dead daemon blocks the bind.
    let _ = std::fs::remove_file(&socket);
    let listener = tokio::net::UnixListener::bind(&socket)
        .with_context(|| format!("binding {}", socket.display()))?;

    info!(stage = stage_name, socket = %socket.display(), "preloading stage daemon");
    let preload_ctx = StageContext::detached(config.clone());
    if let Err(error) = stage.preload(&preload_ctx).await {
        anyhow::bail!("preload failed: {error:?}");
    }
    info!(stage = stage_name, "stage daemon ready");

    loop {
        let (stream, _) = listener.accept().await?;
        let conn = Connection::from_unix(stream, true);
        // Requests are served one at a time; the preload is already done.
        if let Err(error) =
            super::child::serve_request(&config, stage.as_mut(), conn, false).await
        {
            error!(stage = stage_name, %error, "daemon request failed");
        }
    }
}

#[cfg(not(unix))]
pub async fn serve_stage(_config: Arc<Config>, _stage_name: &str) -> Result<()> {
    anyhow::bail!("stage daemons require unix sockets")
}

/// Entry point of `kara-worker --daemon`: one daemon subprocess per
/// daemon-enabled stage, supervised until ctrl-c.
pub async fn run_daemons(config: Arc<Config>, cancel: CancellationToken) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut children = Vec::new();

    for spec in crate::stages::daemon_specs() {
        info!(stage = spec.key, "starting daemon for stage");
        let child = Command::new(&exe)
            .arg("--stage-daemon")
            .arg(spec.key)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning daemon for {}", spec.key))?;
        children.push((spec.key, child));
    }
    info!("daemon processes started");

    for (stage, mut child) in children {
        tokio::select! {
            status = child.wait() => {
                warn!(stage, ?status, "daemon process exited");
            }
            _ = cancel.cancelled() => {
                // kill_on_drop tears the rest down.
                return Ok(());
            }
        }
    }
    Ok(())
}
