use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::AudioCache;
use crate::error::StrategyError;
use crate::ytdlp::Extractor;

/// Terminal result of one full-file acquisition, cloneable so every joined
/// caller receives it.
#[derive(Clone, Debug)]
enum AcquireOutcome {
    Ready(PathBuf),
    TimedOut(String),
    Failed(String),
}

#[derive(Clone, Debug, Error)]
pub enum AcquireFailure {
    #[error("{0}")]
    TimedOut(String),
    #[error("{0}")]
    Failed(String),
}

enum Role {
    Leader(broadcast::Sender<AcquireOutcome>),
    Joiner(broadcast::Receiver<AcquireOutcome>),
}

/// In-flight registry keyed by source id. Concurrent cache misses for the
/// same track join a single extraction instead of racing independent child
/// processes for the same cache slot.
pub struct InflightRegistry {
    jobs: Mutex<HashMap<String, broadcast::Sender<AcquireOutcome>>>,
}

impl Default for InflightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a full-file acquisition for this id is currently running.
    pub fn is_inflight(&self, source_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(source_id)
    }

    fn join_or_lead(&self, source_id: &str) -> Role {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(source_id) {
            Some(tx) => Role::Joiner(tx.subscribe()),
            None => {
                let (tx, _) = broadcast::channel(1);
                jobs.insert(source_id.to_string(), tx.clone());
                Role::Leader(tx)
            }
        }
    }

    fn finish(&self, source_id: &str, tx: &broadcast::Sender<AcquireOutcome>, outcome: AcquireOutcome) {
        // Remove before broadcasting so a late subscriber re-probes the cache
        // instead of waiting on a channel that will never fire again.
        self.jobs.lock().unwrap().remove(source_id);
        let _ = tx.send(outcome);
    }
}

/// Return the cached file for `source_id`, acquiring it first if necessary.
/// At most one extraction runs per id at a time; everyone else awaits the
/// shared outcome.
pub async fn ensure_cached(
    registry: &InflightRegistry,
    extractor: &Extractor,
    cache: &AudioCache,
    source_id: &str,
) -> Result<PathBuf, AcquireFailure> {
    if let Some(path) = cache.probe(source_id) {
        return Ok(path);
    }

    match registry.join_or_lead(source_id) {
        Role::Joiner(mut rx) => {
            tracing::info!(source_id, "joining in-flight acquisition");
            match rx.recv().await {
                Ok(AcquireOutcome::Ready(path)) => Ok(path),
                Ok(AcquireOutcome::TimedOut(msg)) => Err(AcquireFailure::TimedOut(msg)),
                Ok(AcquireOutcome::Failed(msg)) => Err(AcquireFailure::Failed(msg)),
                // Leader finished between subscribe and recv, or aborted;
                // the cache knows which.
                Err(_) => match cache.probe(source_id) {
                    Some(path) => Ok(path),
                    None => Err(AcquireFailure::Failed("acquisition aborted".to_string())),
                },
            }
        }
        Role::Leader(tx) => {
            // Someone else may have finalized while this task was between the
            // probe and the registry lock.
            if let Some(path) = cache.probe(source_id) {
                registry.finish(source_id, &tx, AcquireOutcome::Ready(path.clone()));
                return Ok(path);
            }

            let outcome = match extractor.acquire_file(cache, source_id).await {
                Ok(path) => AcquireOutcome::Ready(path),
                Err(e) if matches!(e.last, StrategyError::Timeout(_)) => {
                    AcquireOutcome::TimedOut(e.to_string())
                }
                Err(e) => AcquireOutcome::Failed(e.to_string()),
            };
            registry.finish(source_id, &tx, outcome.clone());

            match outcome {
                AcquireOutcome::Ready(path) => Ok(path),
                AcquireOutcome::TimedOut(msg) => Err(AcquireFailure::TimedOut(msg)),
                AcquireOutcome::Failed(msg) => Err(AcquireFailure::Failed(msg)),
            }
        }
    }
}
