use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default debounce window for coalescing disk writes.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Stable lookup key for a (title, artist) pair: both sides lowercased and
/// trimmed, joined with `_`, then hashed so the key length is fixed.
pub fn song_key(title: &str, artist: &str) -> String {
    let normalized = format!(
        "{}_{}",
        title.trim().to_lowercase(),
        artist.trim().to_lowercase()
    );
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// One remembered resolution. Field names match the persisted JSON produced
/// by earlier versions of the mapping file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingEntry {
    #[serde(rename = "videoId")]
    pub source_id: String,
    pub title: String,
    /// Unix milliseconds at record time.
    pub timestamp: i64,
}

/// Persistence behind the mapping store. Injected so tests can swap in an
/// in-memory backend with zero debounce.
pub trait MappingBackend: Send + Sync + 'static {
    fn load(&self) -> anyhow::Result<HashMap<String, MappingEntry>>;
    fn save(&self, data: &HashMap<String, MappingEntry>) -> anyhow::Result<()>;
}

/// JSON file backend, one pretty-printed object keyed by digest.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MappingBackend for JsonFileBackend {
    fn load(&self) -> anyhow::Result<HashMap<String, MappingEntry>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, data: &HashMap<String, MappingEntry>) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

struct StoreState {
    /// Loaded lazily on first access, then held in memory for the lifetime
    /// of the store.
    data: Option<HashMap<String, MappingEntry>>,
    flush_scheduled: bool,
}

/// Track-to-source mapping store. Entries are a performance hint, not ground
/// truth: a flush lost to a crash only costs a re-search, because the cache
/// file's existence is authoritative. Writes within the debounce window are
/// coalesced into a single disk write.
pub struct MappingStore {
    backend: Arc<dyn MappingBackend>,
    debounce: Duration,
    state: Arc<Mutex<StoreState>>,
}

impl MappingStore {
    pub fn new(backend: Arc<dyn MappingBackend>, debounce: Duration) -> Self {
        Self {
            backend,
            debounce,
            state: Arc::new(Mutex::new(StoreState {
                data: None,
                flush_scheduled: false,
            })),
        }
    }

    /// Store persisted to a JSON file with the default debounce.
    pub fn with_file(path: PathBuf) -> Self {
        Self::new(Arc::new(JsonFileBackend::new(path)), FLUSH_DEBOUNCE)
    }

    fn load_if_needed(&self, state: &mut StoreState) {
        if state.data.is_none() {
            let data = match self.backend.load() {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load song mapping, starting empty");
                    HashMap::new()
                }
            };
            state.data = Some(data);
        }
    }

    pub fn lookup(&self, title: &str, artist: &str) -> Option<MappingEntry> {
        let key = song_key(title, artist);
        let mut state = self.state.lock().unwrap();
        self.load_if_needed(&mut state);
        state.data.as_ref().and_then(|d| d.get(&key).cloned())
    }

    /// Remember a resolution. A no-op when the key already maps to the same
    /// source id; updated in place when a later extraction resolved the same
    /// track to a different source. Entries are never deleted here.
    pub fn record(&self, title: &str, artist: &str, source_id: &str, resolved_title: &str) {
        let key = song_key(title, artist);
        let mut state = self.state.lock().unwrap();
        self.load_if_needed(&mut state);
        let data = match state.data.as_mut() {
            Some(data) => data,
            None => return,
        };

        match data.get(&key) {
            Some(existing) if existing.source_id == source_id => return,
            _ => {}
        }

        data.insert(
            key,
            MappingEntry {
                source_id: source_id.to_string(),
                title: resolved_title.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
        self.schedule_flush(&mut state);
    }

    /// Fire-and-forget: the caller returns before the disk write happens.
    fn schedule_flush(&self, state: &mut StoreState) {
        if state.flush_scheduled {
            return;
        }

        // Outside a runtime there is nothing to debounce on; write through.
        if tokio::runtime::Handle::try_current().is_err() {
            if let Some(data) = &state.data {
                if let Err(e) = self.backend.save(data) {
                    tracing::warn!(error = %e, "failed to save song mapping");
                }
            }
            return;
        }
        state.flush_scheduled = true;

        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.state);
        let debounce = self.debounce;
        tokio::spawn(async move {
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
            let snapshot = {
                let mut state = shared.lock().unwrap();
                state.flush_scheduled = false;
                state.data.clone()
            };
            if let Some(data) = snapshot {
                if let Err(e) = backend.save(&data) {
                    tracing::warn!(error = %e, "failed to save song mapping");
                }
            }
        });
    }

    /// Write the current in-memory map out immediately.
    pub fn flush(&self) -> anyhow::Result<()> {
        let snapshot = {
            let state = self.state.lock().unwrap();
            state.data.clone()
        };
        if let Some(data) = snapshot {
            self.backend.save(&data)?;
        }
        Ok(())
    }

    /// Final flush for shutdown. Pending debounced writes become irrelevant
    /// once this has run.
    pub fn close(&self) -> anyhow::Result<()> {
        self.flush()
    }
}
