use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::stage::{Stage, StageContext, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// Looks for lyrics in the media metadata or the local caches. Provider
/// lookups live outside this crate; when nothing is available the task
/// soft-fails so the rest of the production still runs.
pub struct FetchLyrics {
    media_path: PathBuf,
}

impl FetchLyrics {
    pub fn new(config: &Arc<Config>) -> FetchLyrics {
        FetchLyrics {
            media_path: config.media_path.clone(),
        }
    }

    fn lookup(&self, ctx: &StageContext, request: &RunRequest) -> Option<(String, String)> {
        if let Some(lyrics) = request.media.metadata.get("lyrics").and_then(Value::as_str) {
            return Some(("media metadata".into(), lyrics.to_owned()));
        }

        let job_cache = ctx.cache_path("lyrics").with_extension("txt");
        if let Ok(lyrics) = std::fs::read_to_string(&job_cache) {
            return Some((job_cache.display().to_string(), lyrics));
        }

        if let Some(title) = request.media.metadata.get("title").and_then(Value::as_str) {
            let shared = self.media_path.join("lyrics").join(format!("{title}.txt"));
            if let Ok(lyrics) = std::fs::read_to_string(&shared) {
                return Some((shared.display().to_string(), lyrics));
            }
        }
        None
    }
}

impl Stage for FetchLyrics {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            ctx.update(TaskPatch {
                message: Some("Fetching lyrics".into()),
                ..Default::default()
            })
            .await?;

            let Some((origin, lyrics)) = self.lookup(ctx, request) else {
                return Ok(TaskResult::SoftFailed("No lyrics available".into()));
            };
            ctx.info(format!("lyrics found in {origin}")).await?;

            ctx.add_artifact(ArtifactSpec {
                name: "Lyrics".into(),
                artifact_type: ArtifactType::Text,
                artifact: Value::from(lyrics.clone()),
                tag: Some("lyrics".into()),
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert("lyrics".into(), Value::from(lyrics));
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::Media;
    use std::collections::HashMap;

    fn harness() -> (Arc<Config>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path()).unwrap());
        (config, dir)
    }

    fn request(metadata: HashMap<String, Value>) -> RunRequest {
        RunRequest {
            jid: "j-1".into(),
            stage: "fetch_lyrics".into(),
            media: Media {
                source: "x".into(),
                metadata,
            },
            args: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_soft_fails_without_any_source() {
        let (config, _dir) = harness();
        let (sink, _rx) = crate::wire::channel::WriteHandle::capturing();
        let ctx = StageContext::new(
            config.clone(),
            "j-1".into(),
            sink,
            Default::default(),
        );

        let mut stage = FetchLyrics::new(&config);
        let result = stage.run(&ctx, &request(HashMap::new())).await;
        assert!(matches!(result, Ok(TaskResult::SoftFailed(_))));
    }

    #[tokio::test]
    async fn test_metadata_lyrics_win() {
        let (config, _dir) = harness();
        let (sink, mut rx) = crate::wire::channel::WriteHandle::capturing();
        let ctx = StageContext::new(
            config.clone(),
            "j-1".into(),
            sink,
            Default::default(),
        );

        let metadata =
            HashMap::from([("lyrics".to_owned(), Value::from("la la la\nla la"))]);
        let mut stage = FetchLyrics::new(&config);
        let result = stage.run(&ctx, &request(metadata)).await;
        assert!(matches!(result, Ok(TaskResult::Success)));

        // The passing args carry the text for the mapping stage.
        let mut saw_args = false;
        while let Ok(frame) = rx.try_recv() {
            if frame["target"] == "passing_args" {
                assert_eq!(frame["body"]["args"]["lyrics"], "la la la\nla la");
                saw_args = true;
            }
        }
        assert!(saw_args);
    }

    #[tokio::test]
    async fn test_job_cache_hit() {
        let (config, dir) = harness();
        let job_dir = dir.path().join("media").join("j-1");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("lyrics.txt"), "cached words").unwrap();

        let (sink, _rx) = crate::wire::channel::WriteHandle::capturing();
        let ctx = StageContext::new(
            config.clone(),
            "j-1".into(),
            sink,
            Default::default(),
        );

        let mut stage = FetchLyrics::new(&config);
        let result = stage.run(&ctx, &request(HashMap::new())).await;
        assert!(matches!(result, Ok(TaskResult::Success)));
    }
}
