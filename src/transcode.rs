use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::TranscodeError;

const TRANSCODE_TIMEOUT_MS: u64 = 120_000;
const AUDIO_BITRATE: &str = "128k";

/// Container metadata to stamp onto the normalized file.
#[derive(Clone, Debug, Default)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

/// Wrapper around the external transcoding tool. Re-encodes whatever
/// container the extractor produced into mp3, optionally stamping tags and
/// an embedded front cover.
#[derive(Clone, Debug)]
pub struct Transcoder {
    ffmpeg: PathBuf,
}

impl Transcoder {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    /// Decode `input`, re-encode to mp3 at a fixed bitrate into `output`,
    /// and inject the supplied tags. Cover bytes, when given, are muxed in as
    /// an attached picture with the conventional per-stream tags.
    ///
    /// Tag values travel as single argv elements, so embedded quotes in
    /// titles cannot break the invocation. Every intermediate artifact is
    /// removed on every exit path; on failure the caller keeps using the
    /// untranscoded input.
    pub async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        tags: &TrackTags,
        cover: Option<&[u8]>,
    ) -> Result<PathBuf, TranscodeError> {
        let cover_path = match cover {
            Some(bytes) => {
                let path = output.with_extension("cover.jpg");
                tokio::fs::write(&path, bytes).await?;
                Some(path)
            }
            None => None,
        };

        let result = self
            .run_ffmpeg(input, output, tags, cover_path.as_deref())
            .await;

        if let Some(path) = &cover_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        if result.is_err() {
            let _ = tokio::fs::remove_file(output).await;
        }

        result.map(|_| output.to_path_buf())
    }

    async fn run_ffmpeg(
        &self,
        input: &Path,
        output: &Path,
        tags: &TrackTags,
        cover: Option<&Path>,
    ) -> Result<(), TranscodeError> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
        ];

        match cover {
            Some(cover_path) => {
                args.push("-i".into());
                args.push(cover_path.display().to_string());
                for arg in [
                    "-map",
                    "0:a",
                    "-map",
                    "1:v",
                    "-c:a",
                    "libmp3lame",
                    "-b:a",
                    AUDIO_BITRATE,
                    "-id3v2_version",
                    "3",
                    "-metadata:s:v",
                    "title=Album cover",
                    "-metadata:s:v",
                    "comment=Cover (front)",
                ] {
                    args.push(arg.into());
                }
            }
            None => {
                for arg in ["-vn", "-c:a", "libmp3lame", "-b:a", AUDIO_BITRATE] {
                    args.push(arg.into());
                }
            }
        }

        for (key, value) in [
            ("title", tags.title.as_deref()),
            ("artist", tags.artist.as_deref()),
            ("album", tags.album.as_deref()),
        ] {
            if let Some(value) = value {
                args.push("-metadata".into());
                args.push(format!("{}={}", key, value));
            }
        }

        args.push(output.display().to_string());

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            cover = cover.is_some(),
            "transcoding"
        );

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = match tokio::time::timeout(
            Duration::from_millis(TRANSCODE_TIMEOUT_MS),
            cmd.output(),
        )
        .await
        {
            Err(_) => return Err(TranscodeError::Timeout(TRANSCODE_TIMEOUT_MS)),
            Ok(Err(e)) => return Err(TranscodeError::Io(e)),
            Ok(Ok(output)) => output,
        };

        if !result.status.success() {
            return Err(TranscodeError::Failed {
                status: result.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&result.stderr)
                    .lines()
                    .last()
                    .unwrap_or("")
                    .to_string(),
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(TranscodeError::EmptyOutput(output.to_path_buf())),
        }
    }
}
