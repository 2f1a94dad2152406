use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;

use super::resolve_media;
use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::progress::run_external;
use crate::pipeline::stage::{str_arg, Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// One timed piece of recognized text; the unit the mapping and alignment
/// stages work in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Speech-to-text over the vocal track via the whisper CLI. Daemon-enabled:
/// the model load dominates short tracks.
pub struct Transcribe {
    tool: String,
    model: String,
    initial_prompt: Option<String>,
    media_path: PathBuf,
}

impl Transcribe {
    pub fn new(config: &Arc<Config>) -> Transcribe {
        Transcribe {
            tool: config.tools.whisper.clone(),
            model: config.transcription.cpu_model.clone(),
            initial_prompt: config.transcription.initial_prompt.clone(),
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for Transcribe {
    fn preload<'a>(&'a mut self, ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            ctx.info(format!("transcription model: {}", self.model)).await
        })
    }

    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let cache = ctx.cache_path("transcript");
            if cache.exists() {
                let segments: Vec<Segment> = serde_json::from_slice(&std::fs::read(&cache)?)?;
                ctx.update(TaskPatch {
                    message: Some("Transcription cache hit".into()),
                    ..Default::default()
                })
                .await?;
                return finish(ctx, &cache, segments).await;
            }

            let input = resolve_media(&self.media_path, str_arg(&request.args, "vocals_path")?);
            ctx.update(TaskPatch {
                message: Some("Transcribing lyrics".into()),
                ..Default::default()
            })
            .await?;

            let out_dir = self.media_path.join(request.jid.clone());
            std::fs::create_dir_all(&out_dir)?;

            let mut command = Command::new(&self.tool);
            command
                .arg(&input)
                .arg("--model")
                .arg(&self.model)
                .arg("--output_format")
                .arg("json")
                .arg("--output_dir")
                .arg(&out_dir);
            if let Some(prompt) = &self.initial_prompt {
                command.arg("--initial_prompt").arg(prompt);
            }
            run_external(ctx, &mut command).await?;

            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".into());
            let produced = out_dir.join(format!("{stem}.json"));
            let segments = parse_whisper_output(&std::fs::read(&produced).map_err(|_| {
                StageError::Failed(anyhow::anyhow!(
                    "transcription produced no output: {}",
                    produced.display()
                ))
            })?)?;

            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cache, serde_json::to_vec(&segments)?)?;
            finish(ctx, &cache, segments).await
        })
    }
}

async fn finish(
    ctx: &StageContext,
    cache: &Path,
    segments: Vec<Segment>,
) -> StageResult {
    ctx.info(format!("transcribed {} segments", segments.len())).await?;
    ctx.add_artifact(ArtifactSpec {
        name: "Transcript".into(),
        artifact_type: ArtifactType::Segments,
        artifact: serde_json::json!({ "segments": segments }),
        tag: Some("transcript".into()),
        is_attached: false,
        attachments: Vec::new(),
    })
    .await?;

    let mut args = Map::new();
    args.insert(
        "transcript_path".into(),
        Value::from(cache.to_string_lossy().into_owned()),
    );
    ctx.set_passing_args(args).await?;
    Ok(TaskResult::Success)
}

/// Extracts the timed segments from whisper's JSON output, dropping empty
/// text.
fn parse_whisper_output(body: &[u8]) -> Result<Vec<Segment>, StageError> {
    let value: Value = serde_json::from_slice(body)?;
    let raw = value["segments"]
        .as_array()
        .ok_or_else(|| StageError::Failed(anyhow::anyhow!("no segments in transcription output")))?;
    let mut segments = Vec::with_capacity(raw.len());
    for entry in raw {
        let text = entry["text"].as_str().unwrap_or("").trim().to_owned();
        if text.is_empty() {
            continue;
        }
        segments.push(Segment {
            start: entry["start"].as_f64().unwrap_or(0.0),
            end: entry["end"].as_f64().unwrap_or(0.0),
            text,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whisper_output() {
        let body = serde_json::json!({
            "text": " la la hmm",
            "segments": [
                {"start": 0.0, "end": 2.5, "text": " la la"},
                {"start": 2.5, "end": 3.0, "text": "   "},
                {"start": 3.0, "end": 5.0, "text": "hmm"},
            ],
        });
        let segments = parse_whisper_output(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "la la");
        assert_eq!(segments[1].start, 3.0);
    }

    #[test]
    fn test_parse_rejects_missing_segments() {
        assert!(parse_whisper_output(b"{\"text\": \"x\"}").is_err());
    }
}
