use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::cache::AudioCache;
use crate::error::{ExtractionError, StrategyError};

/// One declarative way of invoking the extractor: a spoofed client identity,
/// a format selector and a time bound.
#[derive(Clone, Copy, Debug)]
pub struct ExtractionStrategy {
    pub name: &'static str,
    /// Identity-spoof arguments, passed through verbatim.
    pub client_args: &'static [&'static str],
    pub format: &'static str,
    /// Container to assume when the tool writes to stdout and cannot report
    /// the extension it picked.
    pub container: &'static str,
    pub timeout_ms: u64,
}

/// The authoritative strategy list, most-reliable identity first. The order
/// is a deliberate policy choice with measured success rates behind it; do
/// not reorder.
pub const STRATEGIES: &[ExtractionStrategy] = &[
    ExtractionStrategy {
        name: "android",
        client_args: &["--extractor-args", "youtube:player_client=android"],
        format: "bestaudio[ext=m4a]/bestaudio",
        container: "m4a",
        timeout_ms: 120_000,
    },
    ExtractionStrategy {
        name: "ios",
        client_args: &["--extractor-args", "youtube:player_client=ios"],
        format: "bestaudio",
        container: "m4a",
        timeout_ms: 120_000,
    },
    ExtractionStrategy {
        name: "web",
        client_args: &[],
        format: "bestaudio",
        container: "webm",
        timeout_ms: 120_000,
    },
];

const COMMON_ARGS: &[&str] = &["--no-playlist", "--no-warnings", "--force-ipv4"];

/// Metadata lookups are much cheaper than full-file acquisition.
const SEARCH_TIMEOUT_MS: u64 = 10_000;

/// Stderr fragments that mean the platform rejected this client identity
/// rather than the request being transient.
const BLOCK_SIGNATURES: &[&str] = &[
    "sign in to confirm",
    "access denied",
    "http error 403",
    "confirm your age",
    "age-restricted",
];

/// Result of a metadata search.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub source_id: String,
    pub title: String,
    pub duration_secs: u64,
}

fn video_url(source_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", source_id)
}

pub(crate) fn looks_blocked(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    BLOCK_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Runs the external extraction tool. Every invocation is an argument vector;
/// no metadata ever passes through a shell.
#[derive(Clone, Debug)]
pub struct Extractor {
    ytdlp: PathBuf,
}

impl Extractor {
    pub fn new(ytdlp: PathBuf) -> Self {
        Self { ytdlp }
    }

    pub fn tool_path(&self) -> &Path {
        &self.ytdlp
    }

    fn base_command(&self, strategy: &ExtractionStrategy, source_id: &str) -> Command {
        let mut cmd = Command::new(&self.ytdlp);
        cmd.arg(video_url(source_id))
            .args(strategy.client_args)
            .args(["-f", strategy.format]);
        cmd
    }

    /// Run one strategy in file mode. Success requires a non-empty cache file
    /// for the id after a clean exit; anything else fails this strategy only.
    async fn run_strategy_to_file(
        &self,
        strategy: &ExtractionStrategy,
        cache: &AudioCache,
        source_id: &str,
    ) -> Result<PathBuf, StrategyError> {
        let template = cache.output_template(source_id);
        let mut cmd = self.base_command(strategy, source_id);
        cmd.args(["-o", &template])
            .args(COMMON_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(
            Duration::from_millis(strategy.timeout_ms),
            cmd.output(),
        )
        .await
        {
            // Dropping the future kills the child via kill_on_drop.
            Err(_) => return Err(StrategyError::Timeout(strategy.timeout_ms)),
            Ok(Err(e)) => return Err(StrategyError::Io(e)),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if looks_blocked(&stderr) {
                return Err(StrategyError::Blocked(last_line(&stderr)));
            }
            return Err(StrategyError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: last_line(&stderr),
            });
        }

        // A clean exit with nothing usable on disk is still a failure.
        cache.probe(source_id).ok_or(StrategyError::NoOutput)
    }

    /// Walk the authoritative strategy list in order until one yields a
    /// cached file.
    pub async fn acquire_file(
        &self,
        cache: &AudioCache,
        source_id: &str,
    ) -> Result<PathBuf, ExtractionError> {
        self.acquire_with(STRATEGIES, cache, source_id).await
    }

    /// Same walk over an explicit strategy list.
    pub async fn acquire_with(
        &self,
        strategies: &[ExtractionStrategy],
        cache: &AudioCache,
        source_id: &str,
    ) -> Result<PathBuf, ExtractionError> {
        let mut last = None;
        for strategy in strategies {
            tracing::info!(strategy = strategy.name, source_id, "trying extraction strategy");
            match self.run_strategy_to_file(strategy, cache, source_id).await {
                Ok(path) => {
                    tracing::info!(
                        strategy = strategy.name,
                        source_id,
                        path = %path.display(),
                        "extraction succeeded"
                    );
                    return Ok(path);
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name, source_id, error = %e, "strategy failed");
                    last = Some(e);
                }
            }
        }
        Err(ExtractionError {
            last: last.unwrap_or(StrategyError::NoOutput),
        })
    }

    /// Spawn one strategy in stdout mode for the tee'd streaming path. The
    /// caller owns the child and its deadline.
    pub fn spawn_stdout(
        &self,
        strategy: &ExtractionStrategy,
        source_id: &str,
    ) -> std::io::Result<Child> {
        let mut cmd = self.base_command(strategy, source_id);
        cmd.args(["-o", "-"])
            .args(COMMON_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Single metadata search against the platform: first hit's id, title and
    /// duration. Not strategy-iterated; lookups rarely trip bot detection.
    pub async fn search(&self, query: &str) -> Result<SearchHit, StrategyError> {
        let mut cmd = Command::new(&self.ytdlp);
        cmd.arg(format!("ytsearch1:{}", query))
            .args(["--print", "%(id)s|%(title)s|%(duration)s"])
            .args(COMMON_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output =
            match tokio::time::timeout(Duration::from_millis(SEARCH_TIMEOUT_MS), cmd.output())
                .await
            {
                Err(_) => return Err(StrategyError::Timeout(SEARCH_TIMEOUT_MS)),
                Ok(Err(e)) => return Err(StrategyError::Io(e)),
                Ok(Ok(output)) => output,
            };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(StrategyError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: last_line(&stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_search_line(stdout.trim()).ok_or(StrategyError::NoOutput)
    }
}

pub(crate) fn last_line(s: &str) -> String {
    s.lines().last().unwrap_or("").trim().to_string()
}

fn parse_search_line(line: &str) -> Option<SearchHit> {
    let mut parts = line.lines().next()?.splitn(3, '|');
    let source_id = parts.next()?.trim();
    if source_id.is_empty() || source_id == "NA" {
        return None;
    }
    let title = parts.next().unwrap_or("").trim().to_string();
    let duration_secs = parts
        .next()
        .and_then(|d| d.trim().parse::<u64>().ok())
        .unwrap_or(0);
    Some(SearchHit {
        source_id: source_id.to_string(),
        title,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_order_is_android_ios_web() {
        let names: Vec<_> = STRATEGIES.iter().map(|s| s.name).collect();
        assert_eq!(names, ["android", "ios", "web"]);
    }

    #[test]
    fn block_signatures_match_case_insensitively() {
        assert!(looks_blocked("ERROR: Sign in to confirm you're not a bot"));
        assert!(looks_blocked("HTTP Error 403: Forbidden"));
        assert!(!looks_blocked("ERROR: Unable to download webpage"));
    }

    #[test]
    fn search_line_parses_id_title_duration() {
        let hit = parse_search_line("dQw4w9WgXcQ|Never Gonna Give You Up|213").unwrap();
        assert_eq!(hit.source_id, "dQw4w9WgXcQ");
        assert_eq!(hit.title, "Never Gonna Give You Up");
        assert_eq!(hit.duration_secs, 213);
    }

    #[test]
    fn search_line_tolerates_missing_duration() {
        let hit = parse_search_line("abc123|Some Title|NA").unwrap();
        assert_eq!(hit.duration_secs, 0);
        assert!(parse_search_line("").is_none());
    }
}
