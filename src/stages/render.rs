use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::process::Command;

use super::resolve_media;
use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::progress::run_external;
use crate::pipeline::stage::{str_arg, Stage, StageContext, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// The final mux: burns the subtitles into the source video and swaps the
/// audio for the instrumental track.
pub struct RenderVideo {
    ffmpeg: String,
    media_path: PathBuf,
}

impl RenderVideo {
    pub fn new(config: &Arc<Config>) -> RenderVideo {
        RenderVideo {
            ffmpeg: config.tools.ffmpeg.clone(),
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for RenderVideo {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            // Local jobs pass the original file through extraction; youtube
            // jobs pass the downloaded rendition.
            let video = request
                .args
                .get("source_video")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| request.media.source.clone());
            let video = resolve_media(&self.media_path, &video);
            let instrumental =
                resolve_media(&self.media_path, str_arg(&request.args, "instrumental_path")?);
            let subtitles = str_arg(&request.args, "subtitle_path")?;

            ctx.update(TaskPatch {
                message: Some("Rendering karaoke video".into()),
                ..Default::default()
            })
            .await?;

            let out = self.media_path.join(format!("{}_karaoke.mp4", request.jid));
            let mut command = Command::new(&self.ffmpeg);
            command
                .arg("-y")
                .arg("-i")
                .arg(&video)
                .arg("-i")
                .arg(&instrumental)
                .arg("-map")
                .arg("0:v")
                .arg("-map")
                .arg("1:a")
                .arg("-vf")
                .arg(format!("ass={subtitles}"))
                .arg("-c:v")
                .arg("libx264")
                .arg("-c:a")
                .arg("aac")
                .arg(&out);
            run_external(ctx, &mut command).await?;

            ctx.add_artifact(ArtifactSpec {
                name: "Karaoke video".into(),
                artifact_type: ArtifactType::Video,
                artifact: Value::from(out.to_string_lossy().into_owned()),
                tag: Some("result".into()),
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            ctx.update(TaskPatch {
                message: Some("Rendering complete".into()),
                ..Default::default()
            })
            .await?;
            Ok(TaskResult::Success)
        })
    }
}
