use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::resolve_media;
use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::stage::{str_arg, Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

const SILENCE_FILTER: &str = "silencedetect=noise=-30dB:d=0.5";

/// Detects speech spans on the vocal track via ffmpeg silence detection;
/// transcription later skips the silent stretches.
pub struct VoiceActivity {
    ffmpeg: String,
    media_path: PathBuf,
}

impl VoiceActivity {
    pub fn new(config: &Arc<Config>) -> VoiceActivity {
        VoiceActivity {
            ffmpeg: config.tools.ffmpeg.clone(),
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for VoiceActivity {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let input = resolve_media(&self.media_path, str_arg(&request.args, "vocals_path")?);
            ctx.update(TaskPatch {
                message: Some("Detecting voice activity".into()),
                ..Default::default()
            })
            .await?;

            // Parsed rather than streamed: the spans come out of the
            // filter's log lines.
            let output = Command::new(&self.ffmpeg)
                .arg("-i")
                .arg(&input)
                .arg("-af")
                .arg(SILENCE_FILTER)
                .arg("-f")
                .arg("null")
                .arg("-")
                .output()
                .await?;
            ctx.check_interrupt()?;
            if !output.status.success() {
                return Err(StageError::Failed(anyhow::anyhow!(
                    "silence detection failed with {}",
                    output.status
                )));
            }

            let log = String::from_utf8_lossy(&output.stderr);
            let duration = request
                .media
                .metadata
                .get("duration")
                .and_then(Value::as_f64)
                .unwrap_or(f64::MAX);
            let spans = speech_spans(&log, duration);
            ctx.info(format!("found {} speech spans", spans.len())).await?;

            let spans_json = json!(spans
                .iter()
                .map(|(start, end)| json!({"start": start, "end": end}))
                .collect::<Vec<_>>());

            let cache = ctx.cache_path("voice_activity");
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cache, serde_json::to_vec(&spans_json)?)?;

            ctx.add_artifact(ArtifactSpec {
                name: "Speech activity".into(),
                artifact_type: ArtifactType::Json,
                artifact: spans_json.clone(),
                tag: None,
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert("speech_spans".into(), spans_json);
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}

/// Inverts silencedetect output into speech spans over `[0, duration]`.
fn speech_spans(log: &str, duration: f64) -> Vec<(f64, f64)> {
    let mut silences: Vec<(f64, f64)> = Vec::new();
    let mut open: Option<f64> = None;
    for line in log.lines() {
        if let Some(value) = field(line, "silence_start:") {
            open = Some(value);
        } else if let Some(value) = field(line, "silence_end:") {
            if let Some(start) = open.take() {
                silences.push((start, value));
            }
        }
    }
    if let Some(start) = open {
        silences.push((start, duration));
    }

    let mut spans = Vec::new();
    let mut cursor = 0.0;
    for (start, end) in silences {
        if start > cursor {
            spans.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if duration != f64::MAX && cursor < duration {
        spans.push((cursor, duration));
    }
    spans
}

fn field(line: &str, key: &str) -> Option<f64> {
    let index = line.find(key)?;
    line[index + key.len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}
