use clap::{ArgGroup, Parser};

/// Runs one job's pipeline, either bound to a scheduler or from a local
/// source. The stage modes are internal: they host a single task body in
/// its own process.
#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
#[command(group(ArgGroup::new("mode").required(true)))]
pub struct Args {
    /// Job ID assigned by the scheduler.
    #[arg(long = "jobId", group = "mode")]
    pub job_id: Option<String>,
    /// URL to produce karaoke from, without a scheduler.
    #[arg(long, group = "mode")]
    pub url: Option<String>,
    /// Local media file to produce karaoke from, without a scheduler.
    #[arg(long, group = "mode")]
    pub filepath: Option<String>,
    /// Run the preloaded stage daemons.
    #[arg(long, group = "mode")]
    pub daemon: bool,
    /// Internal: run one task body over stdio.
    #[arg(long, group = "mode", hide = true)]
    pub stage: Option<String>,
    /// Internal: serve one task body on its daemon socket.
    #[arg(long = "stage-daemon", group = "mode", hide = true)]
    pub stage_daemon: Option<String>,
}
