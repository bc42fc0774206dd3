#![cfg(unix)]

mod common;

use common::fake_tool;
use soundbridge::error::TranscodeError;
use soundbridge::transcode::{TrackTags, Transcoder};

/// Fake transcoder: dumps its argument vector for inspection and writes the
/// last argument (the output path).
const FAKE_FFMPEG: &str = r#"
dump="$(dirname "$0")/argdump"
printf '%s\n' "$@" > "$dump"
last=""
for a in "$@"; do last="$a"; done
printf 'MP3DATA' > "$last""#;

fn args_dumped(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("argdump"))
        .unwrap()
        .lines()
        .map(|l| l.to_string())
        .collect()
}

#[tokio::test]
async fn normalize_writes_the_output_and_passes_tags_as_single_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.m4a");
    let output = dir.path().join("out.mp3");
    std::fs::write(&input, b"source").unwrap();

    let transcoder = Transcoder::new(fake_tool(dir.path(), "fake-ffmpeg", FAKE_FFMPEG));
    let tags = TrackTags {
        title: Some(r#"She said "no""#.to_string()),
        artist: Some("Artist".to_string()),
        album: None,
    };

    let produced = transcoder
        .normalize(&input, &output, &tags, None)
        .await
        .unwrap();
    assert_eq!(produced, output);
    assert_eq!(std::fs::read(&output).unwrap(), b"MP3DATA");

    let args = args_dumped(dir.path());
    // Quoted metadata rides as one argv element; nothing can break out into
    // a shell.
    assert!(args.contains(&r#"title=She said "no""#.to_string()));
    assert!(args.contains(&"artist=Artist".to_string()));
    assert!(!args.iter().any(|a| a.starts_with("album=")));
    assert!(args.contains(&"libmp3lame".to_string()));
    assert!(args.contains(&"-vn".to_string()));
}

#[tokio::test]
async fn cover_art_is_muxed_as_an_attached_picture() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.m4a");
    let output = dir.path().join("out.mp3");
    std::fs::write(&input, b"source").unwrap();

    let transcoder = Transcoder::new(fake_tool(dir.path(), "fake-ffmpeg", FAKE_FFMPEG));
    transcoder
        .normalize(
            &input,
            &output,
            &TrackTags::default(),
            Some(b"jpeg-bytes".as_slice()),
        )
        .await
        .unwrap();

    let args = args_dumped(dir.path());
    assert!(args.contains(&"0:a".to_string()));
    assert!(args.contains(&"1:v".to_string()));
    assert!(args.contains(&"title=Album cover".to_string()));
    assert!(args.contains(&"comment=Cover (front)".to_string()));

    // The cover temp file was handed to the tool, then cleaned up.
    let cover_arg = args
        .iter()
        .find(|a| a.ends_with("cover.jpg"))
        .expect("cover path passed to the tool");
    assert!(!std::path::Path::new(cover_arg).exists());
}

#[tokio::test]
async fn failed_transcode_cleans_up_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.m4a");
    let output = dir.path().join("out.mp3");
    std::fs::write(&input, b"source").unwrap();

    let script = r#"
last=""
for a in "$@"; do last="$a"; done
printf 'HALFWRITTEN' > "$last"
echo "Conversion failed!" >&2
exit 1"#;
    let transcoder = Transcoder::new(fake_tool(dir.path(), "fake-ffmpeg", script));

    let err = transcoder
        .normalize(&input, &output, &TrackTags::default(), Some(b"img".as_slice()))
        .await
        .unwrap_err();
    assert!(matches!(err, TranscodeError::Failed { .. }));

    // Neither the partial output nor the cover temp may survive.
    assert!(!output.exists());
    assert!(!output.with_extension("cover.jpg").exists());
    // The original input is untouched for the caller's fallback.
    assert_eq!(std::fs::read(&input).unwrap(), b"source");
}

#[tokio::test]
async fn empty_output_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.m4a");
    let output = dir.path().join("out.mp3");
    std::fs::write(&input, b"source").unwrap();

    let script = r#"
last=""
for a in "$@"; do last="$a"; done
: > "$last""#;
    let transcoder = Transcoder::new(fake_tool(dir.path(), "fake-ffmpeg", script));

    let err = transcoder
        .normalize(&input, &output, &TrackTags::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TranscodeError::EmptyOutput(_)));
    assert!(!output.exists());
}
