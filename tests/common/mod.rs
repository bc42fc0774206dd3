#![cfg(unix)]
#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Write a fake extractor executable into `dir` and return its path.
pub fn fake_tool(dir: &Path, name: &str, script_body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Shell prologue shared by the fakes: extracts the `-o` output target into
/// `$out` and logs which spoofed client was used (file mode only).
pub const PARSE_ARGS: &str = r#"
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
client="web"
case "$*" in
  *player_client=android*) client="android" ;;
  *player_client=ios*) client="ios" ;;
esac
if [ "$out" != "-" ] && [ -n "$out" ]; then
  dir=$(dirname "$out")
  echo "$client" >> "$dir/calls.log"
fi
"#;

pub fn calls_log(audio_dir: &Path) -> Vec<String> {
    std::fs::read_to_string(audio_dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(|l| l.to_string())
        .collect()
}
