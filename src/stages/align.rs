use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::process::Command;

use super::resolve_media;
use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::progress::run_external;
use crate::pipeline::stage::{str_arg, Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// Forced alignment of the mapped lines against the vocal track. The
/// aligner is an external tool with a heavy acoustic model, so this stage
/// is daemon-enabled.
pub struct AlignLyrics {
    tool: String,
    media_path: PathBuf,
}

impl AlignLyrics {
    pub fn new(config: &Arc<Config>) -> AlignLyrics {
        AlignLyrics {
            tool: config.tools.aligner.clone(),
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for AlignLyrics {
    fn preload<'a>(&'a mut self, ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move { ctx.info("acoustic model warm-up").await })
    }

    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let cache = ctx.cache_path("align");
            if !cache.exists() {
                let vocals =
                    resolve_media(&self.media_path, str_arg(&request.args, "vocals_path")?);
                let mapped = str_arg(&request.args, "mapped_path")?;
                ctx.update(TaskPatch {
                    message: Some("Aligning lyrics".into()),
                    ..Default::default()
                })
                .await?;

                if let Some(parent) = cache.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut command = Command::new(&self.tool);
                command
                    .arg("align")
                    .arg(&vocals)
                    .arg(mapped)
                    .arg(&cache)
                    .arg("--output_format")
                    .arg("json");
                run_external(ctx, &mut command).await?;

                if !cache.exists() {
                    return Err(StageError::Failed(anyhow::anyhow!(
                        "aligner produced no output: {}",
                        cache.display()
                    )));
                }
            } else {
                ctx.update(TaskPatch {
                    message: Some("Alignment cache hit".into()),
                    ..Default::default()
                })
                .await?;
            }

            let aligned: Value = serde_json::from_slice(&std::fs::read(&cache)?)?;
            if !aligned.is_array() {
                return Err(StageError::Failed(anyhow::anyhow!(
                    "unexpected aligner output shape"
                )));
            }

            ctx.add_artifact(ArtifactSpec {
                name: "Aligned lyrics".into(),
                artifact_type: ArtifactType::Segments,
                artifact: serde_json::json!({ "segments": aligned }),
                tag: Some("aligned".into()),
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert(
                "aligned_path".into(),
                Value::from(cache.to_string_lossy().into_owned()),
            );
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}
