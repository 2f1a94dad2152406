use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::progress::run_external;
use crate::pipeline::stage::{Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// Sources longer than this are refused outright.
const MAX_DURATION_SECS: u64 = 60 * 10;

/// Downloads the video or audio rendition of the source with yt-dlp,
/// probing metadata first and recording it on the job.
pub struct DownloadStage {
    format_key: &'static str,
    tool: String,
    media_path: PathBuf,
}

impl DownloadStage {
    pub fn new(config: &Arc<Config>, format_key: &'static str) -> DownloadStage {
        DownloadStage {
            format_key,
            tool: config.tools.ytdlp.clone(),
            media_path: config.media_path.clone(),
        }
    }

    async fn probe(&self, ctx: &StageContext, url: &str) -> Result<Value, StageError> {
        let output = Command::new(&self.tool)
            .arg("--dump-json")
            .arg("--no-playlist")
            .arg(url)
            .output()
            .await?;
        ctx.check_interrupt()?;
        if !output.status.success() {
            return Err(StageError::Failed(anyhow::anyhow!(
                "metadata probe failed with {}",
                output.status
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

impl Stage for DownloadStage {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let url = request.media.source.clone();
            ctx.update(TaskPatch {
                message: Some(format!("Downloading {} from source", self.format_key)),
                ..Default::default()
            })
            .await?;

            let info = self.probe(ctx, &url).await?;
            let id = info["id"].as_str().unwrap_or("media").to_owned();
            let duration = info["duration"].as_u64().ok_or_else(|| {
                StageError::Failed(anyhow::anyhow!("duration not found in source metadata"))
            })?;
            if duration > MAX_DURATION_SECS {
                return Err(StageError::Failed(anyhow::anyhow!(
                    "source duration is too long: {duration} seconds"
                )));
            }

            let mut metadata = Map::new();
            for key in ["id", "title", "channel", "duration"] {
                if let Some(value) = info.get(key) {
                    metadata.insert(key.to_owned(), value.clone());
                }
            }
            if self.format_key == "video" {
                for key in ["width", "height", "fps"] {
                    if let Some(value) = info.get(key) {
                        metadata.insert(key.to_owned(), value.clone());
                    }
                }
            }
            ctx.update_metadata(metadata).await?;

            let template = self
                .media_path
                .join(format!("%(id)s_{}.%(ext)s", self.format_key));
            let mut command = Command::new(&self.tool);
            command
                .arg("-f")
                .arg(format!("best{}", self.format_key))
                .arg("--newline")
                .arg("--no-playlist")
                .arg("-o")
                .arg(&template)
                .arg(&url);
            run_external(ctx, &mut command).await?;

            let produced = find_by_prefix(&self.media_path, &format!("{id}_{}.", self.format_key))
                .ok_or_else(|| {
                    StageError::Failed(anyhow::anyhow!("download produced no output file"))
                })?;
            let produced = produced.to_string_lossy().into_owned();

            let artifact_type = if self.format_key == "video" {
                ArtifactType::Video
            } else {
                ArtifactType::Audio
            };
            ctx.add_artifact(ArtifactSpec {
                name: format!("Original {}", self.format_key),
                artifact_type,
                artifact: Value::from(produced.clone()),
                tag: None,
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert(format!("source_{}", self.format_key), Value::from(produced));
            ctx.set_passing_args(args).await?;

            ctx.update(TaskPatch {
                message: Some("Download successful".into()),
                ..Default::default()
            })
            .await?;
            Ok(TaskResult::Success)
        })
    }
}

fn find_by_prefix(dir: &std::path::Path, prefix: &str) -> Option<PathBuf> {
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc123_audio.webm"), b"x").unwrap();
        std::fs::write(dir.path().join("abc123_video.mp4"), b"x").unwrap();

        let found = find_by_prefix(dir.path(), "abc123_audio.").unwrap();
        assert!(found.ends_with("abc123_audio.webm"));
        assert!(find_by_prefix(dir.path(), "zzz_audio.").is_none());
    }
}
