//! The production stages and the DAGs wiring them together.
//!
//! Every stage drives an external collaborator (yt-dlp, ffmpeg,
//! audio-separator, whisper, a forced aligner) as a subprocess command or
//! is a pure computation; provider internals stay outside this crate.

mod align;
mod detect;
mod download;
mod extract;
mod lyrics;
mod mapping;
mod render;
mod separate;
mod subtitle;
mod transcribe;

use std::sync::Arc;

use crate::config::Config;
use crate::pipeline::stage::Stage;
use crate::types::job::JobType;

/// Static description of a stage: its wire key, human label, and whether a
/// preloaded daemon may serve it.
#[derive(Debug)]
pub struct StageSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub daemon: bool,
}

pub static DOWNLOAD_VIDEO: StageSpec = StageSpec {
    key: "download_video",
    label: "Video Downloading",
    daemon: false,
};
pub static DOWNLOAD_AUDIO: StageSpec = StageSpec {
    key: "download_audio",
    label: "Audio Downloading",
    daemon: false,
};
pub static EXTRACT_AUDIO: StageSpec = StageSpec {
    key: "extract_audio",
    label: "Audio Extraction",
    daemon: false,
};
pub static SEPARATE_VOCALS: StageSpec = StageSpec {
    key: "separate_vocals",
    label: "Vocal Separation",
    daemon: true,
};
pub static SEPARATE_INSTRUMENTAL: StageSpec = StageSpec {
    key: "separate_instrumental",
    label: "Instrumental Separation",
    daemon: true,
};
pub static VOICE_ACTIVITY: StageSpec = StageSpec {
    key: "voice_activity",
    label: "Voice Activity",
    daemon: false,
};
pub static TRANSCRIBE: StageSpec = StageSpec {
    key: "transcribe",
    label: "Lyrics Transcription",
    daemon: true,
};
pub static FETCH_LYRICS: StageSpec = StageSpec {
    key: "fetch_lyrics",
    label: "Lyrics Fetching",
    daemon: false,
};
pub static MAP_LYRICS: StageSpec = StageSpec {
    key: "map_lyrics",
    label: "Lyrics Mapping",
    daemon: false,
};
pub static ALIGN_LYRICS: StageSpec = StageSpec {
    key: "align_lyrics",
    label: "Lyrics Alignment",
    daemon: true,
};
pub static GENERATE_SUBTITLE: StageSpec = StageSpec {
    key: "generate_subtitle",
    label: "Subtitle Generation",
    daemon: false,
};
pub static RENDER_VIDEO: StageSpec = StageSpec {
    key: "render_video",
    label: "Video Rendering",
    daemon: false,
};

static ALL: &[&StageSpec] = &[
    &DOWNLOAD_VIDEO,
    &DOWNLOAD_AUDIO,
    &EXTRACT_AUDIO,
    &SEPARATE_VOCALS,
    &SEPARATE_INSTRUMENTAL,
    &VOICE_ACTIVITY,
    &TRANSCRIBE,
    &FETCH_LYRICS,
    &MAP_LYRICS,
    &ALIGN_LYRICS,
    &GENERATE_SUBTITLE,
    &RENDER_VIDEO,
];

pub fn spec(key: &str) -> Option<&'static StageSpec> {
    ALL.iter().copied().find(|spec| spec.key == key)
}

/// Stages that expose a long-lived preloaded daemon (the model-heavy ones).
pub fn daemon_specs() -> impl Iterator<Item = &'static StageSpec> {
    ALL.iter().copied().filter(|spec| spec.daemon)
}

/// Instantiates the body for a stage key.
pub fn create(config: &Arc<Config>, key: &str) -> Option<Box<dyn Stage>> {
    Some(match key {
        "download_video" => Box::new(download::DownloadStage::new(config, "video")),
        "download_audio" => Box::new(download::DownloadStage::new(config, "audio")),
        "extract_audio" => Box::new(extract::ExtractAudio::new(config)),
        "separate_vocals" => Box::new(separate::SeparateStage::new(config, separate::Stem::Vocals)),
        "separate_instrumental" => {
            Box::new(separate::SeparateStage::new(config, separate::Stem::Instrumental))
        }
        "voice_activity" => Box::new(detect::VoiceActivity::new(config)),
        "transcribe" => Box::new(transcribe::Transcribe::new(config)),
        "fetch_lyrics" => Box::new(lyrics::FetchLyrics::new(config)),
        "map_lyrics" => Box::new(mapping::MapLyrics::new(config)),
        "align_lyrics" => Box::new(align::AlignLyrics::new(config)),
        "generate_subtitle" => Box::new(subtitle::GenerateSubtitle::new(config)),
        "render_video" => Box::new(render::RenderVideo::new(config)),
        _ => return None,
    })
}

/// Artifact payloads and passing args carry media paths relative to the
/// media directory where possible; absolute paths pass through.
pub(crate) fn resolve_media(media_path: &std::path::Path, path: &str) -> std::path::PathBuf {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        media_path.join(p)
    }
}

/// One node of a pipeline under construction. Prerequisites are indices of
/// earlier definitions, which keeps the graph acyclic by construction.
pub struct TaskDef {
    pub spec: &'static StageSpec,
    pub prerequisites: Vec<usize>,
}

struct DagBuilder {
    defs: Vec<TaskDef>,
}

impl DagBuilder {
    fn new() -> DagBuilder {
        DagBuilder { defs: Vec::new() }
    }

    fn task(&mut self, spec: &'static StageSpec, prerequisites: &[usize]) -> usize {
        let index = self.defs.len();
        for &p in prerequisites {
            // A forward edge would be a cycle; that is a programmer error.
            assert!(p < index, "prerequisite must be defined before its dependent");
        }
        self.defs.push(TaskDef {
            spec,
            prerequisites: prerequisites.to_vec(),
        });
        index
    }
}

/// The production DAG for a job type.
pub fn build_pipeline(job_type: JobType) -> Vec<TaskDef> {
    let mut b = DagBuilder::new();
    let audio_root;
    let video_source;

    match job_type {
        JobType::Youtube => {
            video_source = b.task(&DOWNLOAD_VIDEO, &[]);
            audio_root = b.task(&DOWNLOAD_AUDIO, &[]);
        }
        JobType::Local => {
            audio_root = b.task(&EXTRACT_AUDIO, &[]);
            video_source = audio_root;
        }
    }

    let lyrics = match job_type {
        // Lyrics come out of the downloaded metadata when nothing better
        // is cached.
        JobType::Youtube => b.task(&FETCH_LYRICS, &[video_source]),
        JobType::Local => b.task(&FETCH_LYRICS, &[]),
    };

    let vocals = b.task(&SEPARATE_VOCALS, &[audio_root]);
    // The second separation also waits on the first: one GPU task at a
    // time.
    let instrumental = b.task(&SEPARATE_INSTRUMENTAL, &[audio_root, vocals]);

    // Transcribing audio without silence reduces hallucination.
    let activity = b.task(&VOICE_ACTIVITY, &[vocals]);
    let transcript = b.task(&TRANSCRIBE, &[activity, vocals]);

    // The mapping previews against the vocal-only track.
    let mapped = b.task(&MAP_LYRICS, &[lyrics, transcript, vocals]);
    let aligned = b.task(&ALIGN_LYRICS, &[vocals, mapped]);
    let subtitle = b.task(&GENERATE_SUBTITLE, &[aligned]);

    b.task(
        &RENDER_VIDEO,
        &[video_source, instrumental, vocals, subtitle],
    );

    b.defs
}
