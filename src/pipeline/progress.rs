use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::stage::{StageContext, StageError};

/// External tools are read in small chunks so `\r` progress updates surface
/// promptly; this matches the cancellation latency bound of one output
/// chunk.
const READ_CHUNK: usize = 32;

/// Splits a tool's output stream into completed log lines and the current
/// in-place progress message.
///
/// Tools overwrite their progress line with `\r`; the most recent
/// `\r`-delimited segment of the unfinished line is the live message (with
/// its `\r` kept while the line is still being overwritten). Completed
/// `\n` lines are returned for logging.
#[derive(Debug, Default)]
pub struct ProgressBuffer {
    pending: String,
    last_message: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Progress {
    pub lines: Vec<String>,
    /// Set only when the live message changed.
    pub message: Option<String>,
}

impl ProgressBuffer {
    pub fn feed(&mut self, chunk: &str) -> Progress {
        self.pending.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            lines.push(line.trim_end_matches('\n').to_owned());
        }

        // Overwritten progress segments never surface again; keeping the
        // last two bounds the buffer on long `\r`-only streams.
        let bounds: Vec<usize> = self
            .pending
            .char_indices()
            .filter(|(_, c)| *c == '\r')
            .map(|(i, _)| i)
            .collect();
        if bounds.len() >= 2 {
            self.pending.drain(..bounds[bounds.len() - 2] + 1);
        }

        let message = self.current_message();
        let message = if message.as_deref() != self.last_message.as_deref() && message.is_some() {
            self.last_message = message.clone();
            message
        } else {
            None
        };

        Progress { lines, message }
    }

    fn current_message(&self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let segments: Vec<&str> = self.pending.split('\r').collect();
        let mut message = if self.pending.ends_with('\r') || segments.len() == 1 {
            segments[segments.len() - 1].to_owned()
        } else {
            segments[segments.len() - 2].to_owned()
        };
        if message.is_empty() && segments.len() >= 2 {
            message = segments[segments.len() - 2].to_owned();
        }
        if message.is_empty() {
            return None;
        }
        if self.pending.contains('\r') {
            message.push('\r');
        }
        Some(message)
    }

    /// Flushes whatever is left as completed lines at end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.pending);
        rest.split('\r')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// Runs an external command, streaming its merged stdout/stderr through the
/// context: completed lines as info logs, `\r` segments as the task's live
/// message. The interrupt checkpoint fires at every chunk; on interrupt the
/// child is killed before the error propagates.
pub async fn run_external(ctx: &StageContext, command: &mut Command) -> Result<(), StageError> {
    let program = format!("{:?}", command.as_std());
    ctx.debug(format!("running: {program}")).await?;

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let mut buffer = ProgressBuffer::default();
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        let read = tokio::select! {
            read = stdout.read(&mut out_chunk), if out_open => {
                match read? {
                    0 => { out_open = false; continue; }
                    n => String::from_utf8_lossy(&out_chunk[..n]).into_owned(),
                }
            }
            read = stderr.read(&mut err_chunk), if err_open => {
                match read? {
                    0 => { err_open = false; continue; }
                    n => String::from_utf8_lossy(&err_chunk[..n]).into_owned(),
                }
            }
        };

        let progress = buffer.feed(&read);
        if let Err(interrupt) = forward(ctx, progress).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(interrupt);
        }
    }

    for line in buffer.finish() {
        ctx.info(line).await?;
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(StageError::Failed(anyhow::anyhow!(
            "command exited with {status}: {program}"
        )));
    }
    Ok(())
}

async fn forward(ctx: &StageContext, progress: Progress) -> Result<(), StageError> {
    for line in progress.lines {
        ctx.info(line).await?;
    }
    if let Some(message) = progress.message {
        ctx.passive_message(message).await?;
    }
    Ok(())
}
