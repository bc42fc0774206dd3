use std::path::PathBuf;

const APP_DIR_NAME: &str = "SoundBridge";

/// Environment override for the cache base directory (useful in containers).
const CACHE_DIR_ENV: &str = "SOUNDBRIDGE_CACHE_DIR";
const YTDLP_ENV: &str = "YT_DLP_PATH";
const FFMPEG_ENV: &str = "FFMPEG_PATH";

/// Resolved filesystem layout and external tool locations.
#[derive(Clone, Debug)]
pub struct PathConfig {
    /// Base cache directory (`<os cache>/SoundBridge` unless overridden).
    pub cache_root: PathBuf,
    /// Directory holding finalized audio files and in-flight temp files.
    pub audio_dir: PathBuf,
    /// Persisted track-to-source mapping, kept next to the audio directory.
    pub mapping_file: PathBuf,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
}

impl PathConfig {
    /// Build the layout under an explicit base directory.
    pub fn new(cache_root: PathBuf) -> Self {
        let audio_dir = cache_root.join("audio");
        let mapping_file = cache_root.join("song-mapping.json");
        Self {
            cache_root,
            audio_dir,
            mapping_file,
            ytdlp_path: resolve_tool(YTDLP_ENV, "yt-dlp"),
            ffmpeg_path: resolve_tool(FFMPEG_ENV, "ffmpeg"),
        }
    }

    /// Resolve the base directory from the environment, falling back to the
    /// per-OS cache convention (macOS `~/Library/Caches`, Windows
    /// `%LOCALAPPDATA%`, elsewhere `$XDG_CACHE_HOME` or `~/.cache`).
    pub fn from_env() -> Self {
        let base = std::env::var(CACHE_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(APP_DIR_NAME)
            });
        Self::new(base)
    }

    /// Create every directory the engine writes into. Idempotent.
    pub fn ensure_directories_exist(&self) -> std::io::Result<()> {
        for dir in [&self.cache_root, &self.audio_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// Tool location: environment override wins when it points at an existing
/// file, otherwise rely on PATH lookup by bare name.
fn resolve_tool(env_var: &str, fallback: &str) -> PathBuf {
    if let Ok(p) = std::env::var(env_var) {
        let candidate = PathBuf::from(&p);
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from(fallback)
}
