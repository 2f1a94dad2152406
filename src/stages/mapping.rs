use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::transcribe::Segment;
use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::stage::{str_arg, Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// Matches lyric lines onto transcript segments, producing the timed line
/// list everything downstream consumes. Falls back to the raw transcript
/// when the lyrics stage soft-failed.
pub struct MapLyrics {
    media_path: PathBuf,
}

impl MapLyrics {
    pub fn new(config: &Arc<Config>) -> MapLyrics {
        MapLyrics {
            media_path: config.media_path.clone(),
        }
    }
}

impl Stage for MapLyrics {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            ctx.update(TaskPatch {
                message: Some("Mapping lyrics to transcription".into()),
                ..Default::default()
            })
            .await?;

            let transcript_path = str_arg(&request.args, "transcript_path")?;
            let segments: Vec<Segment> =
                serde_json::from_slice(&std::fs::read(transcript_path)?)?;
            if segments.is_empty() {
                return Err(StageError::Failed(anyhow::anyhow!(
                    "transcript has no segments to map against"
                )));
            }

            let lines: Vec<String> = match request.args.get("lyrics").and_then(Value::as_str) {
                Some(lyrics) => lyric_lines(lyrics),
                None => {
                    ctx.warning("no lyrics available, mapping transcript text").await?;
                    segments.iter().map(|s| s.text.clone()).collect()
                }
            };
            if lines.is_empty() {
                return Err(StageError::Failed(anyhow::anyhow!("no lyric lines to map")));
            }

            let mapped = map_lines(&segments, &lines);
            ctx.info(format!(
                "mapped {} lines onto {} segments",
                mapped.len(),
                segments.len()
            ))
            .await?;

            let cache = ctx.cache_path("mapped");
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cache, serde_json::to_vec(&mapped)?)?;

            // The mapped segments ship with a vocal-only preview so the
            // front-end can audition the mapping.
            let mut attachments = Vec::new();
            if let Some(vocals) = request.args.get("vocals_path").and_then(Value::as_str) {
                attachments.push(ArtifactSpec {
                    name: "preview".into(),
                    artifact_type: ArtifactType::Audio,
                    artifact: Value::from(
                        super::resolve_media(&self.media_path, vocals)
                            .to_string_lossy()
                            .into_owned(),
                    ),
                    tag: None,
                    is_attached: true,
                    attachments: Vec::new(),
                });
            }
            ctx.add_artifact(ArtifactSpec {
                name: "Mapped lyrics".into(),
                artifact_type: ArtifactType::Segments,
                artifact: serde_json::json!({ "segments": mapped }),
                tag: Some("mapped".into()),
                is_attached: false,
                attachments,
            })
            .await?;

            let mut args = Map::new();
            args.insert(
                "mapped_path".into(),
                Value::from(cache.to_string_lossy().into_owned()),
            );
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}

fn lyric_lines(lyrics: &str) -> Vec<String> {
    lyrics
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Distributes lyric lines over transcript segments proportionally by
/// index, keeping each line's timing from the segment it lands on. Lines
/// sharing a segment split its span evenly.
fn map_lines(segments: &[Segment], lines: &[String]) -> Vec<Segment> {
    let mut mapped = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        let slot = index * segments.len() / lines.len();
        let segment = &segments[slot];

        // How many lines share this segment, and which of them are we?
        let first = (slot * lines.len() + segments.len() - 1) / segments.len();
        let after = ((slot + 1) * lines.len() + segments.len() - 1) / segments.len();
        let share = (after - first).max(1);
        let position = index - first;

        let width = (segment.end - segment.start) / share as f64;
        mapped.push(Segment {
            start: segment.start + width * position as f64,
            end: segment.start + width * (position + 1) as f64,
            text: line.clone(),
        });
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(spans: &[(f64, f64)]) -> Vec<Segment> {
        spans
            .iter()
            .enumerate()
            .map(|(i, &(start, end))| Segment {
                start,
                end,
                text: format!("segment {i}"),
            })
            .collect()
    }

    #[test]
    fn test_lyric_lines_strips_blanks() {
        assert_eq!(
            lyric_lines("first\n\n  second  \n\n"),
            vec!["first", "second"]
        );
    }

    #[test]
    fn test_one_line_per_segment() {
        let segs = segments(&[(0.0, 2.0), (2.0, 4.0)]);
        let lines = vec!["a".to_owned(), "b".to_owned()];
        let mapped = map_lines(&segs, &lines);
        assert_eq!(mapped.len(), 2);
        assert_eq!((mapped[0].start, mapped[0].end), (0.0, 2.0));
        assert_eq!((mapped[1].start, mapped[1].end), (2.0, 4.0));
        assert_eq!(mapped[1].text, "b");
    }

    #[test]
    fn test_more_lines_than_segments_share_spans() {
        let segs = segments(&[(0.0, 4.0)]);
        let lines = vec!["a".to_owned(), "b".to_owned()];
        let mapped = map_lines(&segs, &lines);
        assert_eq!((mapped[0].start, mapped[0].end), (0.0, 2.0));
        assert_eq!((mapped[1].start, mapped[1].end), (2.0, 4.0));
    }

    #[test]
    fn test_more_segments_than_lines_keeps_order() {
        let segs = segments(&[(0.0, 1.0), (1.0, 2.0), (2.0, 3.0), (3.0, 4.0)]);
        let lines = vec!["a".to_owned(), "b".to_owned()];
        let mapped = map_lines(&segs, &lines);
        assert_eq!(mapped.len(), 2);
        assert!(mapped[0].start < mapped[1].start);
        // Timing always comes from real segments.
        assert_eq!(mapped[0].start, 0.0);
        assert_eq!(mapped[1].start, 2.0);
    }
}
