use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::BotResult;

struct Entry {
    value: Value,
    loaded_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Bumped by every invalidation; a load that straddles one is discarded.
    generation: u64,
}

/// Read-through cache of settings documents keyed by logical name.
///
/// Entries live until invalidated or until the periodic sweep finds them
/// older than the TTL. Misses are not cached.
pub struct SettingsCache {
    state: Mutex<State>,
    ttl: Duration,
}

impl SettingsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ttl,
        }
    }

    /// Cached value for `key`, or the loader's result stored for next time.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> BotResult<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BotResult<Option<Value>>>,
    {
        let generation = {
            let state = self.state.lock().await;
            if let Some(entry) = state.entries.get(key) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(Some(entry.value.clone()));
                }
            }
            state.generation
        };

        // The lock is not held across the loader; two concurrent misses both load.
        let loaded = loader().await?;
        if let Some(value) = &loaded {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                debug!(key, "Settings cache filled");
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        loaded_at: Instant::now(),
                    },
                );
            } else {
                debug!(key, "Settings invalidated during load, not caching");
            }
        }
        Ok(loaded)
    }

    pub async fn invalidate(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.entries.remove(key);
    }

    /// Remove expired entries; returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.loaded_at.elapsed() < self.ttl);
        before - state.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}
