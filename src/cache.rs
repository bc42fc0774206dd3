use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Audio container extensions the cache recognizes, in lookup priority order.
/// Every read path (stream, prepare, download, export) consults this one list.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "m4a", "mp4", "mp3", "webm", "opus", "ogg", "wav", "aac", "flac",
];

/// Container the prepare endpoint normalizes into.
pub const CANONICAL_EXTENSION: &str = "mp3";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Content-Type from the file extension alone.
pub fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "mp4" | "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "webm" => "audio/webm",
        "opus" => "audio/opus",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        _ => "audio/mpeg",
    }
}

pub fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}

/// Replace anything that could escape the cache directory when a source id is
/// spliced into a file name.
fn sanitize_id(source_id: &str) -> String {
    source_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// On-disk audio cache. A file is cached if and only if it is visible under
/// `<dir>/<source_id>.<ext>` with non-zero size; in-flight writes live under
/// unique `.temp.` names and become visible only through an atomic rename.
#[derive(Clone, Debug)]
pub struct AudioCache {
    audio_dir: PathBuf,
}

impl AudioCache {
    pub fn new(audio_dir: PathBuf) -> Self {
        Self { audio_dir }
    }

    pub fn dir(&self) -> &Path {
        &self.audio_dir
    }

    /// First extension in priority order with an existing, non-empty file.
    /// Zero-length leftovers from aborted writes never count as hits.
    pub fn probe(&self, source_id: &str) -> Option<PathBuf> {
        let id = sanitize_id(source_id);
        for ext in AUDIO_EXTENSIONS {
            let path = self.audio_dir.join(format!("{}.{}", id, ext));
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() > 0 => return Some(path),
                _ => {}
            }
        }
        None
    }

    pub fn final_path(&self, source_id: &str, ext: &str) -> PathBuf {
        self.audio_dir
            .join(format!("{}.{}", sanitize_id(source_id), ext))
    }

    /// Unique transitional name for one in-flight write. The pid/sequence
    /// suffix keeps concurrent writers for the same id from clobbering each
    /// other's partial data.
    pub fn temp_path(&self, source_id: &str, ext: &str) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.audio_dir.join(format!(
            "{}.temp.{}-{}.{}",
            sanitize_id(source_id),
            std::process::id(),
            seq,
            ext
        ))
    }

    /// Output template handed to the extractor in file mode; the tool picks
    /// the real extension.
    pub fn output_template(&self, source_id: &str) -> String {
        self.audio_dir
            .join(format!("{}.%(ext)s", sanitize_id(source_id)))
            .to_string_lossy()
            .to_string()
    }

    /// Whether a partial write for this id is sitting on disk.
    pub fn has_temp_artifacts(&self, source_id: &str) -> bool {
        let prefix = format!("{}.temp.", sanitize_id(source_id));
        match std::fs::read_dir(&self.audio_dir) {
            Ok(entries) => entries.flatten().any(|e| {
                e.file_name()
                    .to_str()
                    .map(|name| name.starts_with(&prefix))
                    .unwrap_or(false)
            }),
            Err(_) => false,
        }
    }

    /// Remove orphaned temp files. Meant for startup, when no extraction can
    /// be in flight; partial writes from a crashed process must never be
    /// promoted, only swept.
    pub fn cleanup_stale_temps(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.audio_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.contains(".temp.") {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(file = name, error = %e, "failed to remove stale temp file");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
