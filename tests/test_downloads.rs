#![cfg(unix)]

mod common;

use common::{fake_tool, PARSE_ARGS};
use soundbridge::cache::AudioCache;
use soundbridge::downloads::{ensure_cached, InflightRegistry};
use soundbridge::ytdlp::Extractor;

fn setup() -> (tempfile::TempDir, AudioCache, InflightRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let cache = AudioCache::new(dir.path().to_path_buf());
    (dir, cache, InflightRegistry::new())
}

#[tokio::test]
async fn cached_file_short_circuits_without_spawning() {
    let (dir, cache, registry) = setup();
    std::fs::write(dir.path().join("vid1.m4a"), b"already here").unwrap();
    // A tool that would fail loudly if it were ever invoked.
    let extractor = Extractor::new(fake_tool(dir.path(), "fake-ytdlp", "exit 99"));

    let path = ensure_cached(&registry, &extractor, &cache, "vid1")
        .await
        .unwrap();
    assert_eq!(path, dir.path().join("vid1.m4a"));
}

#[tokio::test]
async fn concurrent_misses_share_one_extraction() {
    let (dir, cache, registry) = setup();
    let script = format!(
        r#"{}
echo x >> "$(dirname "$out")/invocations"
sleep 1
path=$(printf '%s' "$out" | sed 's/%(ext)s/m4a/')
printf 'SHAREDAUDIO' > "$path""#,
        PARSE_ARGS
    );
    let extractor = Extractor::new(fake_tool(dir.path(), "fake-ytdlp", &script));

    let (a, b, c) = tokio::join!(
        ensure_cached(&registry, &extractor, &cache, "vidC"),
        ensure_cached(&registry, &extractor, &cache, "vidC"),
        ensure_cached(&registry, &extractor, &cache, "vidC"),
    );

    let expected = dir.path().join("vidC.m4a");
    assert_eq!(a.unwrap(), expected);
    assert_eq!(b.unwrap(), expected);
    assert_eq!(c.unwrap(), expected);

    let invocations = std::fs::read_to_string(dir.path().join("invocations")).unwrap();
    assert_eq!(invocations.lines().count(), 1);
    assert!(!registry.is_inflight("vidC"));
}

#[tokio::test]
async fn joined_callers_see_the_shared_failure() {
    let (dir, cache, registry) = setup();
    let script = r#"
sleep 1
echo "ERROR: Video unavailable" >&2
exit 1"#;
    let extractor = Extractor::new(fake_tool(dir.path(), "fake-ytdlp", script));

    let (a, b) = tokio::join!(
        ensure_cached(&registry, &extractor, &cache, "vidF"),
        ensure_cached(&registry, &extractor, &cache, "vidF"),
    );

    assert!(a.is_err());
    assert!(b.is_err());
    assert!(!registry.is_inflight("vidF"));
}

#[tokio::test]
async fn distinct_ids_do_not_serialize_on_each_other() {
    let (dir, cache, registry) = setup();
    let script = format!(
        r#"{}
path=$(printf '%s' "$out" | sed 's/%(ext)s/m4a/')
printf 'AUDIO' > "$path""#,
        PARSE_ARGS
    );
    let extractor = Extractor::new(fake_tool(dir.path(), "fake-ytdlp", &script));

    let (a, b) = tokio::join!(
        ensure_cached(&registry, &extractor, &cache, "vidX"),
        ensure_cached(&registry, &extractor, &cache, "vidY"),
    );
    assert_eq!(a.unwrap(), dir.path().join("vidX.m4a"));
    assert_eq!(b.unwrap(), dir.path().join("vidY.m4a"));
}
