//! Memoization of model queries for attribution runs.
//!
//! A [`CoalitionCache`] maps a [`CacheKey`] to the value a model query
//! produced. Entries are append-only and never invalidated: for a fixed
//! prompt and fixed model parameters a key always maps to the same value.
//! Each key is computed at most once, even when concurrent runs ask for it
//! at the same moment; a failed computation leaves the slot empty.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::trace;

/// SHA-256 fingerprint of a prompt, hex encoded.
pub fn prompt_fingerprint(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity of a cached model query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Completion of the empty user message. Shared by every prompt in a session.
    Baseline,
    /// Completion of an unmodified prompt.
    FullPrompt { prompt: String },
    /// Completion of a prompt with only these significant positions retained.
    /// Members are sorted and deduplicated.
    Coalition { prompt: String, members: Vec<usize> },
    /// A literal text, e.g. a perturbed prompt sent for embedding.
    Text(String),
}

impl CacheKey {
    pub fn full_prompt(prompt: &str) -> Self {
        CacheKey::FullPrompt {
            prompt: prompt_fingerprint(prompt),
        }
    }

    /// Key for a coalition; member order and duplicates do not matter.
    pub fn coalition<I>(prompt_fingerprint: &str, members: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let members: BTreeSet<usize> = members.into_iter().collect();
        CacheKey::Coalition {
            prompt: prompt_fingerprint.to_string(),
            members: members.into_iter().collect(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        CacheKey::Text(text.into())
    }

    /// Stable hex digest of the key, identical across processes.
    pub fn stable_hash(&self) -> String {
        let canonical = match self {
            CacheKey::Baseline => "baseline".to_string(),
            CacheKey::FullPrompt { prompt } => format!("full:{prompt}"),
            CacheKey::Coalition { prompt, members } => {
                let joined: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                format!("coalition:{prompt}:{}", joined.join(","))
            }
            CacheKey::Text(text) => format!("text:{text}"),
        };
        prompt_fingerprint(&canonical)
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Compute the hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Counters accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            entries: self.entries,
        }
    }
}

/// Append-only, concurrency-safe memo table.
pub struct CoalitionCache<V> {
    entries: Mutex<HashMap<CacheKey, Arc<OnceCell<V>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> std::fmt::Debug for CoalitionCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalitionCache")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> Default for CoalitionCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl<V: Clone + Send + Sync> CoalitionCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: CacheKey) -> Arc<OnceCell<V>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(key).or_default().clone()
    }

    /// Return the cached value for `key`, computing it with `compute` on first use.
    ///
    /// Concurrent callers for the same key wait for the single in-flight
    /// computation. Errors are returned to the caller that computed and are
    /// not stored.
    pub async fn get_or_compute<F, Fut, E>(&self, key: CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.slot(key.clone());
        if let Some(value) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key.stable_hash(), "Cache hit");
            return Ok(value.clone());
        }

        let mut computed = false;
        let value = cell
            .get_or_try_init(|| {
                computed = true;
                compute()
            })
            .await?;

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key.stable_hash(), "Cache miss");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value.clone())
    }

    /// Look up a value without computing it.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of keys holding a computed value.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
