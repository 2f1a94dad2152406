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

#[derive(Clone, Copy, Debug)]
pub enum Stem {
    Vocals,
    Instrumental,
}

impl Stem {
    fn name(self) -> &'static str {
        match self {
            Stem::Vocals => "Vocals",
            Stem::Instrumental => "Instrumental",
        }
    }

    fn arg_key(self) -> &'static str {
        match self {
            Stem::Vocals => "vocals_path",
            Stem::Instrumental => "instrumental_path",
        }
    }
}

/// Splits one stem out of the mixed track with the separator tool. Model
/// inference is heavy, so this stage is daemon-enabled.
pub struct SeparateStage {
    stem: Stem,
    tool: String,
    media_path: PathBuf,
}

impl SeparateStage {
    pub fn new(config: &Arc<Config>, stem: Stem) -> SeparateStage {
        SeparateStage {
            stem,
            tool: config.tools.separator.clone(),
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for SeparateStage {
    fn preload<'a>(&'a mut self, ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            // The separator loads its model per invocation; a daemon keeps
            // the process (and its caches) warm between jobs.
            ctx.info(format!("separation model warm-up ({})", self.stem.name()))
                .await
        })
    }

    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let input = resolve_media(&self.media_path, str_arg(&request.args, "source_audio")?);
            ctx.update(TaskPatch {
                message: Some(format!("Separating {}", self.stem.name())),
                ..Default::default()
            })
            .await?;

            let mut command = Command::new(&self.tool);
            command
                .arg(&input)
                .arg("--output_dir")
                .arg(&self.media_path)
                .arg("--output_format")
                .arg("wav")
                .arg("--single_stem")
                .arg(self.stem.name());
            run_external(ctx, &mut command).await?;

            let stem_name = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".into());
            let out = self
                .media_path
                .join(format!("{stem_name}_({}).wav", self.stem.name()));
            if !out.exists() {
                return Err(StageError::Failed(anyhow::anyhow!(
                    "separator produced no {} output",
                    self.stem.name()
                )));
            }

            ctx.add_artifact(ArtifactSpec {
                name: format!("{} track", self.stem.name()),
                artifact_type: ArtifactType::Audio,
                artifact: Value::from(out.to_string_lossy().into_owned()),
                tag: Some(self.stem.name().to_owned()),
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert(
                self.stem.arg_key().into(),
                Value::from(out.to_string_lossy().into_owned()),
            );
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}
