use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single extraction strategy. These never cross the component
/// boundary on their own; the executor absorbs them and moves on to the next
/// strategy, surfacing only the last one once every strategy is exhausted.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("extractor timed out after {0} ms")]
    Timeout(u64),

    /// The platform refused the spoofed client identity (bot check, age gate,
    /// access denied).
    #[error("platform refused client identity: {0}")]
    Blocked(String),

    #[error("extractor exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    /// Clean exit, but no payload was produced. A zero-byte result is a
    /// failure, never a success.
    #[error("extractor exited cleanly without producing audio")]
    NoOutput,

    #[error("extractor i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl StrategyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StrategyError::Timeout(_))
    }
}

/// Terminal acquisition failure: the whole strategy list was tried in order
/// and none produced audio. Carries the last underlying error for diagnostics.
#[derive(Debug, Error)]
#[error("all extraction strategies failed; last error: {last}")]
pub struct ExtractionError {
    pub last: StrategyError,
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder timed out after {0} ms")]
    Timeout(u64),

    #[error("transcoder exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("transcoder produced no output at {0}")]
    EmptyOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
