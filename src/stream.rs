use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{content_type_for, AudioCache};
use crate::error::{ExtractionError, StrategyError};
use crate::ytdlp::{last_line, looks_blocked, ExtractionStrategy, Extractor, STRATEGIES};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 64;
const EXIT_WAIT: Duration = Duration::from_secs(5);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, io::Error>> + Send>>;

/// A live extraction already producing bytes. The body terminates when the
/// extractor process does, whatever the outcome.
pub struct LiveStream {
    pub strategy: &'static str,
    pub content_type: &'static str,
    pub body: ByteStream,
}

impl std::fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStream")
            .field("strategy", &self.strategy)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Stream audio for `source_id` while persisting it, walking the strategy
/// list until one produces a first byte of payload. Bytes reach the client
/// sink and the temp file in arrival order with no whole-stream buffering;
/// the cache file appears atomically, and only after a clean exit.
pub async fn stream_and_cache(
    extractor: &Extractor,
    cache: &AudioCache,
    source_id: &str,
) -> Result<LiveStream, ExtractionError> {
    stream_with_strategies(extractor, cache, source_id, STRATEGIES).await
}

/// Same flow over an explicit strategy list.
pub async fn stream_with_strategies(
    extractor: &Extractor,
    cache: &AudioCache,
    source_id: &str,
    strategies: &'static [ExtractionStrategy],
) -> Result<LiveStream, ExtractionError> {
    let mut last = None;
    for strategy in strategies {
        tracing::info!(strategy = strategy.name, source_id, "trying live extraction strategy");
        match try_strategy(extractor, cache, source_id, strategy).await {
            Ok(live) => return Ok(live),
            Err(e) => {
                tracing::warn!(strategy = strategy.name, source_id, error = %e, "live strategy failed");
                last = Some(e);
            }
        }
    }
    Err(ExtractionError {
        last: last.unwrap_or(StrategyError::NoOutput),
    })
}

async fn try_strategy(
    extractor: &Extractor,
    cache: &AudioCache,
    source_id: &str,
    strategy: &'static ExtractionStrategy,
) -> Result<LiveStream, StrategyError> {
    let deadline = Instant::now() + Duration::from_millis(strategy.timeout_ms);
    let mut child = extractor.spawn_stdout(strategy, source_id)?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "extractor stdout not captured"))?;

    // Drain stderr in the background so the child never blocks on a full
    // pipe; the buffer is only consulted when the stream dies without bytes.
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    });

    // A strategy counts as alive only once it has produced a real payload
    // byte. A clean zero-byte close is a failure for this strategy.
    let mut first = vec![0u8; CHUNK_SIZE];
    let n = match tokio::time::timeout_at(deadline, stdout.read(&mut first)).await {
        Err(_) => {
            let _ = child.kill().await;
            return Err(StrategyError::Timeout(strategy.timeout_ms));
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(StrategyError::Io(e));
        }
        Ok(Ok(0)) => {
            let status = tokio::time::timeout(EXIT_WAIT, child.wait()).await;
            let stderr_buf = stderr_task.await.unwrap_or_default();
            let stderr_str = String::from_utf8_lossy(&stderr_buf).trim().to_string();
            if looks_blocked(&stderr_str) {
                return Err(StrategyError::Blocked(last_line(&stderr_str)));
            }
            return match status {
                Ok(Ok(s)) if !s.success() => Err(StrategyError::Failed {
                    status: s.code().unwrap_or(-1),
                    stderr: last_line(&stderr_str),
                }),
                _ => Err(StrategyError::NoOutput),
            };
        }
        Ok(Ok(n)) => n,
    };
    first.truncate(n);

    let temp = cache.temp_path(source_id, strategy.container);
    let mut file = match tokio::fs::File::create(&temp).await {
        Ok(f) => f,
        Err(e) => {
            let _ = child.kill().await;
            return Err(StrategyError::Io(e));
        }
    };
    if let Err(e) = file.write_all(&first).await {
        let _ = child.kill().await;
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(StrategyError::Io(e));
    }

    let (tx, rx) = mpsc::channel::<Result<Vec<u8>, io::Error>>(CHANNEL_DEPTH);
    // Channel was just created; the first send cannot fail.
    let _ = tx.send(Ok(first)).await;

    let final_path = cache.final_path(source_id, strategy.container);
    let ctx = PumpContext {
        child,
        stdout,
        file,
        temp,
        final_path,
        tx,
        deadline,
        source_id: source_id.to_string(),
        strategy: strategy.name,
        written: n as u64,
    };
    tokio::spawn(pump(ctx));

    let body: ByteStream = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    Ok(LiveStream {
        strategy: strategy.name,
        content_type: content_type_for(strategy.container),
        body,
    })
}

struct PumpContext {
    child: Child,
    stdout: ChildStdout,
    file: tokio::fs::File,
    temp: PathBuf,
    final_path: PathBuf,
    tx: mpsc::Sender<Result<Vec<u8>, io::Error>>,
    deadline: Instant,
    source_id: String,
    strategy: &'static str,
    written: u64,
}

/// Fan every chunk out to the response channel and the temp file, then
/// finalize. Dropping `tx` at the end is what terminates the HTTP response,
/// so every exit path of this function ends the downstream sink.
async fn pump(mut ctx: PumpContext) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut client_connected = true;

    let failure: Option<&str> = loop {
        match tokio::time::timeout_at(ctx.deadline, ctx.stdout.read(&mut buf)).await {
            Err(_) => {
                let _ = ctx.child.kill().await;
                break Some("deadline exceeded");
            }
            Ok(Err(e)) => {
                tracing::warn!(source_id = %ctx.source_id, error = %e, "read from extractor failed");
                let _ = ctx.child.kill().await;
                break Some("read error");
            }
            Ok(Ok(0)) => break None,
            Ok(Ok(n)) => {
                ctx.written += n as u64;
                if let Err(e) = ctx.file.write_all(&buf[..n]).await {
                    tracing::warn!(source_id = %ctx.source_id, error = %e, "cache write failed mid-stream");
                    let _ = ctx.child.kill().await;
                    break Some("write error");
                }
                if client_connected && ctx.tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    // Client went away; keep caching so the work isn't wasted.
                    client_connected = false;
                    tracing::debug!(source_id = %ctx.source_id, "client disconnected, caching continues");
                }
            }
        }
    };

    let _ = ctx.file.flush().await;
    drop(ctx.file);

    if let Some(reason) = failure {
        tracing::warn!(
            source_id = %ctx.source_id,
            strategy = ctx.strategy,
            reason,
            bytes = ctx.written,
            "live extraction aborted, discarding partial file"
        );
        let _ = tokio::fs::remove_file(&ctx.temp).await;
        return;
    }

    let status = tokio::time::timeout(EXIT_WAIT, ctx.child.wait()).await;
    let clean_exit = matches!(&status, Ok(Ok(s)) if s.success());

    if !clean_exit {
        // The bytes already streamed cannot be recalled; the player deals
        // with the truncated stream. The partial file must not become
        // visible under the final name.
        tracing::warn!(
            source_id = %ctx.source_id,
            strategy = ctx.strategy,
            bytes = ctx.written,
            "extractor exited uncleanly after partial data, discarding temp file"
        );
        let _ = tokio::fs::remove_file(&ctx.temp).await;
        return;
    }

    if ctx.final_path.exists() {
        // Content at a given id is immutable once finalized; a concurrent
        // writer already won the slot.
        let _ = tokio::fs::remove_file(&ctx.temp).await;
        tracing::info!(source_id = %ctx.source_id, "cache file already present, dropping duplicate");
        return;
    }

    match tokio::fs::rename(&ctx.temp, &ctx.final_path).await {
        Ok(()) => {
            tracing::info!(
                source_id = %ctx.source_id,
                strategy = ctx.strategy,
                bytes = ctx.written,
                path = %ctx.final_path.display(),
                "stream finalized into cache"
            );
        }
        Err(e) => {
            if ctx.final_path.exists() {
                let _ = tokio::fs::remove_file(&ctx.temp).await;
            } else {
                tracing::warn!(source_id = %ctx.source_id, error = %e, "failed to finalize cache file");
                let _ = tokio::fs::remove_file(&ctx.temp).await;
            }
        }
    }
}
