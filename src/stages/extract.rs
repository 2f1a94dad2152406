use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::process::Command;

use super::resolve_media;
use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::progress::run_external;
use crate::pipeline::stage::{Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// Extracts a PCM track from a local media file with ffmpeg; the root of
/// local pipelines.
pub struct ExtractAudio {
    ffmpeg: String,
    media_path: PathBuf,
}

impl ExtractAudio {
    pub fn new(config: &Arc<Config>) -> ExtractAudio {
        ExtractAudio {
            ffmpeg: config.tools.ffmpeg.clone(),
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for ExtractAudio {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let source = resolve_media(&self.media_path, &request.media.source);
            if !source.exists() {
                return Err(StageError::Failed(anyhow::anyhow!(
                    "input file not found: {}",
                    source.display()
                )));
            }
            ctx.update(TaskPatch {
                message: Some("Extracting audio track".into()),
                ..Default::default()
            })
            .await?;

            let stem = source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".into());
            let out = self.media_path.join(format!("{stem}_audio.wav"));

            let mut command = Command::new(&self.ffmpeg);
            command
                .arg("-y")
                .arg("-i")
                .arg(&source)
                .arg("-vn")
                .arg("-acodec")
                .arg("pcm_s16le")
                .arg("-ar")
                .arg("44100")
                .arg(&out);
            run_external(ctx, &mut command).await?;

            ctx.add_artifact(ArtifactSpec {
                name: "Extracted audio".into(),
                artifact_type: ArtifactType::Audio,
                artifact: Value::from(out.to_string_lossy().into_owned()),
                tag: None,
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert(
                "source_audio".into(),
                Value::from(out.to_string_lossy().into_owned()),
            );
            args.insert(
                "source_video".into(),
                Value::from(source.to_string_lossy().into_owned()),
            );
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}
