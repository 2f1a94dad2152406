use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::{info, warn};

/// Process-wide configuration, read once from `config.ini` in the working
/// directory and passed by reference from there on. Components never
/// construct their own copy.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: String,

    /// Directory holding job dumps, media files, and per-job caches.
    pub media_path: PathBuf,

    pub scheduler_host: String,
    pub scheduler_port: u16,
    /// Maximum silence (seconds) tolerated between worker updates before
    /// the watchdog interrupts the job.
    pub min_job_response_time: u64,
    /// In-memory job cap; one finished job is evicted per submit beyond it.
    pub max_daemon_jobs: usize,

    pub tools: Tools,
    pub transcription: Transcription,
    pub export_font: String,

    pub acoustid_enabled: bool,
    pub acoustid_api_key: String,
    pub gpt_enabled: bool,
    pub gpt_endpoint: String,
    pub gpt_token: String,
}

/// External tool binaries driven by pipeline stages.
#[derive(Clone, Debug)]
pub struct Tools {
    pub ffmpeg: String,
    pub ytdlp: String,
    pub separator: String,
    pub whisper: String,
    pub aligner: String,
}

#[derive(Clone, Debug)]
pub struct Transcription {
    pub cpu_model: String,
    pub gpu_model: String,
    pub initial_prompt: Option<String>,
}

impl Config {
    /// Reads `config.ini` from `work_dir`, falling back to defaults for
    /// every missing key, and creates the media path if absent.
    pub fn load(work_dir: &Path) -> anyhow::Result<Config> {
        let path = work_dir.join("config.ini");
        let ini = if path.exists() {
            Ini::load_from_file(&path)?
        } else {
            warn!("config file not found, using defaults");
            Ini::new()
        };

        let get = |section: &str, key: &str| -> Option<String> {
            ini.get_from(Some(section), key).map(str::to_owned)
        };

        let media_path = get("media", "path")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("media"));

        let config = Config {
            log_level: get("logging", "level").unwrap_or_else(|| "INFO".into()),
            media_path,
            scheduler_host: get("scheduler", "host").unwrap_or_else(|| "0.0.0.0".into()),
            scheduler_port: parse_or(get("scheduler", "port"), 8201),
            min_job_response_time: parse_or(get("scheduler", "min_job_response_time"), 60 * 5),
            max_daemon_jobs: parse_or(get("scheduler", "max_daemon_jobs"), 10),
            tools: Tools {
                ffmpeg: get("tools", "ffmpeg").unwrap_or_else(|| "ffmpeg".into()),
                ytdlp: get("tools", "ytdlp").unwrap_or_else(|| "yt-dlp".into()),
                separator: get("tools", "separator").unwrap_or_else(|| "audio-separator".into()),
                whisper: get("tools", "whisper").unwrap_or_else(|| "whisper".into()),
                aligner: get("tools", "aligner").unwrap_or_else(|| "mfa".into()),
            },
            transcription: Transcription {
                cpu_model: get("transcription", "cpu_model")
                    .unwrap_or_else(|| "large-v3-turbo".into()),
                gpu_model: get("transcription", "gpu_model").unwrap_or_else(|| "medium".into()),
                initial_prompt: get("transcription", "initial_prompt"),
            },
            export_font: get("export", "font").unwrap_or_else(|| "Arial".into()),
            acoustid_enabled: parse_or(get("acoustid", "enabled"), false),
            acoustid_api_key: get("acoustid", "api_key").unwrap_or_else(|| "xxxxxxxxx".into()),
            gpt_enabled: parse_or(get("gpt", "enabled"), false),
            gpt_endpoint: get("gpt", "endpoint")
                .unwrap_or_else(|| "http://localhost:8080/api/chat/completions".into()),
            gpt_token: get("gpt", "token").unwrap_or_else(|| "xxxxxxxxx".into()),
        };

        if !config.media_path.exists() {
            info!(path = %config.media_path.display(), "media path does not exist, creating");
            std::fs::create_dir_all(&config.media_path)?;
        }

        Ok(config)
    }

    /// Directory holding stage-daemon sockets.
    pub fn daemon_dir(&self) -> PathBuf {
        self.media_path.join("daemon")
    }

    /// Canonical per-job cache location: `<media_path>/<jid>/<stage>.json`.
    pub fn cache_path(&self, jid: &str, stage: &str) -> PathBuf {
        self.media_path.join(jid).join(format!("{stage}.json"))
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_ascii_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "WARNING" | "WARN" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.scheduler_port, 8201);
        assert_eq!(config.min_job_response_time, 300);
        assert_eq!(config.max_daemon_jobs, 10);
        assert_eq!(config.media_path, dir.path().join("media"));
        assert!(config.media_path.exists());
        assert_eq!(config.export_font, "Arial");
    }

    #[test]
    fn test_reads_ini_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.ini"),
            concat!(
                "[logging]\nlevel = DEBUG\n",
                "[scheduler]\nhost = 127.0.0.1\nport = 9000\n",
                "min_job_response_time = 10\nmax_daemon_jobs = 2\n",
                "[media]\npath = ./stash\n",
                "[tools]\nffmpeg = /opt/ffmpeg\n",
            ),
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        assert_eq!(config.scheduler_host, "127.0.0.1");
        assert_eq!(config.scheduler_port, 9000);
        assert_eq!(config.min_job_response_time, 10);
        assert_eq!(config.max_daemon_jobs, 2);
        assert_eq!(config.tools.ffmpeg, "/opt/ffmpeg");
        assert_eq!(config.tools.ytdlp, "yt-dlp");
    }

    #[test]
    fn test_cache_path_is_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let a = config.cache_path("jid-a", "transcript");
        let b = config.cache_path("jid-b", "transcript");
        assert_ne!(a, b);
        assert!(a.ends_with("jid-a/transcript.json"));
    }
}
