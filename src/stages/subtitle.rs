use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::pipeline::events::{ArtifactSpec, RunRequest};
use crate::pipeline::stage::{str_arg, Stage, StageContext, StageError, StageResult, TaskResult};
use crate::types::task::{ArtifactType, TaskPatch};

/// Renders the aligned lines into an ASS subtitle script with per-word
/// karaoke timing where the aligner provided words.
pub struct GenerateSubtitle {
    font: String,
}

impl GenerateSubtitle {
    pub fn new(config: &Arc<Config>) -> GenerateSubtitle {
        GenerateSubtitle {
            font: config.export_font.clone(),
        }
    }
}

impl Stage for GenerateSubtitle {
    fn run<'a>(
        &'a mut self,
        ctx: &'a StageContext,
        request: &'a RunRequest,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            ctx.update(TaskPatch {
                message: Some("Generating subtitles".into()),
                ..Default::default()
            })
            .await?;

            let aligned_path = str_arg(&request.args, "aligned_path")?;
            let aligned: Value = serde_json::from_slice(&std::fs::read(aligned_path)?)?;
            let lines = aligned.as_array().ok_or_else(|| {
                StageError::Failed(anyhow::anyhow!("unexpected aligned segments shape"))
            })?;

            let script = build_ass(lines, &self.font);
            let out = ctx.cache_path("subtitles").with_extension("ass");
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, &script)?;
            ctx.info(format!("wrote {} dialogue lines", lines.len())).await?;

            ctx.add_artifact(ArtifactSpec {
                name: "Subtitles".into(),
                artifact_type: ArtifactType::Text,
                artifact: Value::from(script),
                tag: Some("subtitles".into()),
                is_attached: false,
                attachments: Vec::new(),
            })
            .await?;

            let mut args = Map::new();
            args.insert(
                "subtitle_path".into(),
                Value::from(out.to_string_lossy().into_owned()),
            );
            ctx.set_passing_args(args).await?;
            Ok(TaskResult::Success)
        })
    }
}

fn build_ass(lines: &[Value], font: &str) -> String {
    let mut script = format!(
        "[Script Info]\n\
         ScriptType: v4.00+\n\
         PlayResX: 1920\n\
         PlayResY: 1080\n\
         \n\
         [V4+ Styles]\n\
         Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, Alignment\n\
         Style: Karaoke,{font},72,&H00FFFFFF,&H000088EF,2\n\
         \n\
         [Events]\n\
         Format: Layer, Start, End, Style, Text\n"
    );

    for line in lines {
        let start = line["start"].as_f64().unwrap_or(0.0);
        let end = line["end"].as_f64().unwrap_or(start);
        let text = match line["words"].as_array() {
            Some(words) if !words.is_empty() => karaoke_text(words),
            _ => line["text"].as_str().unwrap_or("").to_owned(),
        };
        script.push_str(&format!(
            "Dialogue: 0,{},{},Karaoke,{}\n",
            timestamp(start),
            timestamp(end),
            text
        ));
    }
    script
}

/// `\k` tags take centiseconds per word.
fn karaoke_text(words: &[Value]) -> String {
    let mut text = String::new();
    for (index, word) in words.iter().enumerate() {
        let start = word["start"].as_f64().unwrap_or(0.0);
        let end = word["end"].as_f64().unwrap_or(start);
        let centis = ((end - start) * 100.0).round().max(0.0) as u64;
        if index > 0 {
            text.push(' ');
        }
        text.push_str(&format!(
            "{{\\k{centis}}}{}",
            word["text"].as_str().unwrap_or("")
        ));
    }
    text
}

fn timestamp(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds / 60.0) as u64) % 60;
    let centis = ((seconds * 100.0).round() as u64) % 6000;
    format!("{hours}:{minutes:02}:{:02}.{:02}", centis / 100, centis % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_format() {
        assert_eq!(timestamp(0.0), "0:00:00.00");
        assert_eq!(timestamp(61.25), "0:01:01.25");
        assert_eq!(timestamp(3723.5), "1:02:03.50");
    }

    #[test]
    fn test_plain_line_without_words() {
        let lines = vec![json!({"start": 1.0, "end": 3.0, "text": "la la"})];
        let script = build_ass(&lines, "Arial");
        assert!(script.contains("Style: Karaoke,Arial,"));
        assert!(script.contains("Dialogue: 0,0:00:01.00,0:00:03.00,Karaoke,la la"));
    }

    #[test]
    fn test_karaoke_tags_per_word() {
        let lines = vec![json!({
            "start": 0.0,
            "end": 1.5,
            "text": "la la",
            "words": [
                {"start": 0.0, "end": 0.5, "text": "la"},
                {"start": 0.5, "end": 1.5, "text": "la"},
            ],
        })];
        let script = build_ass(&lines, "Arial");
        assert!(script.contains("{\\k50}la {\\k100}la"));
    }
}
