//! Intercepting resource cache with per-key fetch deduplication.
//!
//! Every resource the browser requests during a capture goes through a
//! [`ResourceCache`]. A cache instance is one *generation*: it belongs to a
//! single capture session, and its contents become that session's archive.
//!
//! Guarantees:
//!
//! - at most one network fetch is in flight per [`ResourceKey`]; concurrent
//!   callers for the same key subscribe to the outstanding fetch
//! - a successful fetch is stored exactly once and then served from memory
//! - a failed fetch is reported to every waiting caller and is **not** stored,
//!   so the next request for that key tries the network again
//!
//! [`CacheStore`] hands out generations and keeps a bounded number of finished
//! ones around, evicting the oldest first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::fetcher::ResourceFetcher;
use crate::resource::{CachedResource, ResourceKey, ResourceRequest};
use crate::{Error, Result};

/// Outcome of a shared fetch. Must be `Clone` so every subscriber gets a copy.
type FetchOutcome = std::result::Result<Arc<CachedResource>, FetchFailure>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Size limits for a single cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    /// Maximum total payload bytes stored.
    pub max_bytes: usize,
    /// Maximum number of stored resources.
    pub max_entries: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256MB
            max_entries: 2_000,
        }
    }
}

#[derive(Debug, Clone)]
enum FetchFailure {
    Network { reason: String, status: Option<u16> },
    Limited(String),
}

impl FetchFailure {
    fn from_error(err: &Error) -> Self {
        match err {
            Error::ResourceFetch { reason, status, .. } => Self::Network {
                reason: reason.clone(),
                status: *status,
            },
            other => Self::Network {
                reason: other.to_string(),
                status: None,
            },
        }
    }

    fn into_error(self, key: &ResourceKey) -> Error {
        match self {
            Self::Network { reason, status } => Error::ResourceFetch {
                key: key.to_string(),
                reason,
                status,
            },
            Self::Limited(reason) => Error::ResourceLimited(format!("{key}: {reason}")),
        }
    }
}

#[derive(Default)]
struct GenerationState {
    entries: HashMap<ResourceKey, Arc<CachedResource>>,
    /// Insertion order of `entries`, so archives list resources as the page loaded them.
    order: Vec<ResourceKey>,
    in_flight: HashMap<ResourceKey, SharedFetch>,
    bytes: usize,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    joined: AtomicU64,
    network_fetches: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time counters for a cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSummary {
    /// Requests served from stored entries.
    pub hits: u64,
    /// Requests that subscribed to an already running fetch.
    pub joined: u64,
    /// Underlying network fetches issued.
    pub network_fetches: u64,
    /// Network fetches that failed.
    pub failures: u64,
    /// Successful fetches not stored because a limit was reached.
    pub rejected: u64,
    /// Resources currently stored.
    pub entries: usize,
    /// Payload bytes currently stored.
    pub bytes: usize,
}

/// One generation of the intercepting resource cache.
pub struct ResourceCache {
    generation: u64,
    fetcher: Arc<dyn ResourceFetcher>,
    limits: GenerationLimits,
    state: Arc<Mutex<GenerationState>>,
    stats: Arc<CacheStats>,
}

impl ResourceCache {
    /// Create a standalone generation.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, limits: GenerationLimits) -> Self {
        Self::with_generation(0, fetcher, limits)
    }

    fn with_generation(
        generation: u64,
        fetcher: Arc<dyn ResourceFetcher>,
        limits: GenerationLimits,
    ) -> Self {
        Self {
            generation,
            fetcher,
            limits,
            state: Arc::new(Mutex::new(GenerationState::default())),
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Generation number assigned by the [`CacheStore`].
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Return the stored resource for `request`, fetching it if needed.
    ///
    /// Concurrent calls for the same key share one underlying fetch. If
    /// `cancel` fires first the caller gets [`Error::Cancelled`]; the shared
    /// fetch keeps running for any other subscriber, and is forgotten when
    /// there is none, so a later request for the key starts afresh.
    pub async fn fetch(
        &self,
        request: &ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<CachedResource>> {
        let key = request.key();
        let shared = {
            let mut state = self.state.lock();
            if let Some(hit) = state.entries.get(&key) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "cache hit");
                return Ok(Arc::clone(hit));
            }
            if let Some(pending) = state.in_flight.get(&key) {
                self.stats.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "joining in-flight fetch");
                pending.clone()
            } else {
                let pending = self.start_fetch(request.clone(), key.clone());
                state.in_flight.insert(key.clone(), pending.clone());
                pending
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = shared.clone() => Some(outcome),
        };
        match outcome {
            Some(outcome) => outcome.map_err(|failure| failure.into_error(&key)),
            None => {
                self.abandon(&key, &shared);
                Err(Error::Cancelled(format!("fetch of {key}")))
            },
        }
    }

    /// Forget an in-flight fetch nobody but the map is waiting on any more.
    fn abandon(&self, key: &ResourceKey, shared: &SharedFetch) {
        let mut state = self.state.lock();
        // The map and `shared` are the only two handles left.
        let orphaned = state
            .in_flight
            .get(key)
            .is_some_and(|pending| pending.ptr_eq(shared) && pending.strong_count() == Some(2));
        if orphaned {
            state.in_flight.remove(key);
            debug!(key = %key, "dropped abandoned fetch");
        }
    }

    fn start_fetch(&self, request: ResourceRequest, key: ResourceKey) -> SharedFetch {
        let fetcher = Arc::clone(&self.fetcher);
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        let limits = self.limits;

        async move {
            stats.network_fetches.fetch_add(1, Ordering::Relaxed);
            let outcome = fetcher.fetch(&request).await;

            let mut state = state.lock();
            state.in_flight.remove(&key);

            let fetched = match outcome {
                Ok(fetched) => fetched,
                Err(err) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(FetchFailure::from_error(&err));
                },
            };

            let resource = Arc::new(fetched.into_cached(&request));
            if state.entries.len() >= limits.max_entries {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "cache generation is full, resource not stored");
                return Err(FetchFailure::Limited(format!(
                    "generation holds the maximum of {} resources",
                    limits.max_entries
                )));
            }
            if state.bytes + resource.size() > limits.max_bytes {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, size = resource.size(), "cache generation byte budget exceeded");
                return Err(FetchFailure::Limited(format!(
                    "storing {} bytes would exceed the {} byte budget",
                    resource.size(),
                    limits.max_bytes
                )));
            }

            state.bytes += resource.size();
            state.order.push(key.clone());
            state.entries.insert(key, Arc::clone(&resource));
            Ok(resource)
        }
        .boxed()
        .shared()
    }

    /// Stored resource for a key, without fetching.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<CachedResource>> {
        self.state.lock().entries.get(key).cloned()
    }

    /// All stored resources in the order they were stored.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<CachedResource>> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|key| state.entries.get(key).cloned())
            .collect()
    }

    /// Remove a stored resource so it is not part of this generation.
    pub fn discard(&self, key: &ResourceKey) -> bool {
        let mut state = self.state.lock();
        let Some(removed) = state.entries.remove(key) else {
            return false;
        };
        state.bytes -= removed.size();
        state.order.retain(|k| k != key);
        debug!(key = %key, "discarded cached resource");
        true
    }

    /// Keys of all stored resources.
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.state.lock().order.clone()
    }

    /// Number of stored resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing has been stored yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drop every stored entry and forget in-flight fetches.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.in_flight.clear();
        state.bytes = 0;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSummary {
        let state = self.state.lock();
        CacheStatsSummary {
            hits: self.stats.hits.load(Ordering::Relaxed),
            joined: self.stats.joined.load(Ordering::Relaxed),
            network_fetches: self.stats.network_fetches.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            entries: state.entries.len(),
            bytes: state.bytes,
        }
    }
}

/// Hands out cache generations and retains a bounded number of finished ones.
pub struct CacheStore {
    fetcher: Arc<dyn ResourceFetcher>,
    limits: GenerationLimits,
    retained: usize,
    next_generation: AtomicU64,
    finished: Mutex<VecDeque<Arc<ResourceCache>>>,
}

impl CacheStore {
    /// Create a store whose generations fetch through `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, config: &CacheConfig) -> Self {
        Self {
            fetcher,
            limits: GenerationLimits {
                max_bytes: config.max_generation_bytes,
                max_entries: config.max_generation_entries,
            },
            retained: config.retained_generations,
            next_generation: AtomicU64::new(1),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    /// Start a fresh generation for a capture session.
    #[must_use]
    pub fn begin_generation(&self) -> Arc<ResourceCache> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(generation, "starting cache generation");
        Arc::new(ResourceCache::with_generation(
            generation,
            Arc::clone(&self.fetcher),
            self.limits,
        ))
    }

    /// Mark a generation as finished, evicting the oldest retained ones
    /// beyond the configured limit.
    pub fn finish_generation(&self, cache: Arc<ResourceCache>) {
        let mut finished = self.finished.lock();
        finished.push_back(cache);
        while finished.len() > self.retained {
            if let Some(evicted) = finished.pop_front() {
                debug!(generation = evicted.generation(), "evicting cache generation");
                evicted.clear();
            }
        }
    }

    /// Look up a retained, finished generation.
    #[must_use]
    pub fn finished_generation(&self, generation: u64) -> Option<Arc<ResourceCache>> {
        self.finished
            .lock()
            .iter()
            .find(|cache| cache.generation() == generation)
            .cloned()
    }

    /// Number of retained finished generations.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.finished.lock().len()
    }
}
