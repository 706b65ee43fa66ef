//! Subscription-scoped resource cache.
//!
//! A resource is cached exactly as long as at least one subscriber is
//! interested in it. The first subscriber triggers a fetch, concurrent
//! interest shares the in-flight fetch, change notifications refetch only for
//! watched keys, and the last subscriber leaving purges the entry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_transport::ChannelHandle;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::RegistryConfig;
use crate::correlator::Correlator;
use crate::error::RequestError;
use crate::fanout::ChangeListener;
use crate::sink::StateSink;
use crate::state::SubscriberId;

/// Where cached resources come from.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Value, RequestError>;
}

/// Fetches resources with a request on an already joined channel.
pub struct ChannelSource {
    handle: Arc<dyn ChannelHandle>,
    correlator: Correlator,
    event: String,
    key_field: String,
}

impl ChannelSource {
    pub fn new(handle: Arc<dyn ChannelHandle>, config: &RegistryConfig) -> Self {
        Self {
            handle,
            correlator: Correlator::new(config.request_timeout()),
            event: config.fetch_event.clone(),
            key_field: config.resource_key_field.clone(),
        }
    }
}

#[async_trait]
impl ResourceSource for ChannelSource {
    async fn fetch(&self, key: &str) -> Result<Value, RequestError> {
        let mut payload = Map::new();
        payload.insert(self.key_field.clone(), Value::String(key.to_string()));
        self.correlator
            .request(self.handle.as_ref(), &self.event, Value::Object(payload))
            .await
            .into_result()
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, RequestError>>>;

struct CacheEntry {
    generation: u64,
    data: Option<Value>,
    subscribers: HashSet<SubscriberId>,
    loading: Option<SharedFetch>,
    refetch_pending: bool,
    last_error: Option<RequestError>,
    eviction_timer: Option<EvictionTimer>,
}

struct EvictionTimer {
    token: u64,
    task: JoinHandle<()>,
}

impl CacheEntry {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            data: None,
            subscribers: HashSet::new(),
            loading: None,
            refetch_pending: false,
            last_error: None,
            eviction_timer: None,
        }
    }
}

enum FetchEffect {
    Loaded(Value),
    Failed(RequestError),
}

struct CacheShared {
    source: Arc<dyn ResourceSource>,
    sink: Arc<dyn StateSink>,
    grace: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    next_generation: AtomicU64,
    next_timer: AtomicU64,
}

impl CacheShared {
    /// Starts a fetch for `key` and marks the entry loading. The caller holds
    /// the entries lock and has checked that nothing is in flight.
    fn start_fetch(self: &Arc<Self>, key: &str, entry: &mut CacheEntry) -> SharedFetch {
        let source = Arc::clone(&self.source);
        let owned = key.to_string();
        let fetch = async move { source.fetch(&owned).await }.boxed().shared();
        entry.loading = Some(fetch.clone());

        let weak = Arc::downgrade(self);
        let generation = entry.generation;
        let key = key.to_string();
        let driver = fetch.clone();
        debug!(target: "realtime.cache", key = %key, generation, "fetching resource");
        tokio::spawn(async move {
            let result = driver.await;
            if let Some(shared) = weak.upgrade() {
                shared.finish_fetch(&key, generation, result);
            }
        });
        fetch
    }

    fn finish_fetch(self: &Arc<Self>, key: &str, generation: u64, result: Result<Value, RequestError>) {
        let effect = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries
                .get_mut(key)
                .filter(|entry| entry.generation == generation)
            else {
                debug!(target: "realtime.cache", key, generation, "discarding fetch for evicted resource");
                return;
            };
            entry.loading = None;
            if entry.refetch_pending {
                entry.refetch_pending = false;
                if !entry.subscribers.is_empty() {
                    debug!(target: "realtime.cache", key, "resource changed mid-fetch, fetching again");
                    let _ = self.start_fetch(key, entry);
                }
                return;
            }
            match result {
                Ok(data) => {
                    entry.data = Some(data.clone());
                    entry.last_error = None;
                    FetchEffect::Loaded(data)
                }
                Err(err) => {
                    entry.last_error = Some(err.clone());
                    FetchEffect::Failed(err)
                }
            }
        };

        match effect {
            FetchEffect::Loaded(data) => {
                trace!(target: "realtime.cache", key, "resource loaded");
                self.sink.resource_loaded(key, &data);
            }
            FetchEffect::Failed(err) => {
                warn!(target: "realtime.cache", key, error = %err, "resource fetch failed");
                self.sink.resource_failed(key, &err);
            }
        }
    }

    fn evict_after_grace(&self, key: &str, generation: u64, token: u64) {
        let mut entries = self.entries.lock();
        let idle = entries
            .get(key)
            .map(|entry| {
                entry.generation == generation
                    && entry.eviction_timer.as_ref().map(|timer| timer.token) == Some(token)
                    && entry.subscribers.is_empty()
            })
            .unwrap_or(false);
        if idle {
            entries.remove(key);
            debug!(target: "realtime.cache", key, "resource evicted after grace period");
        }
    }
}

/// Per-resource cache whose lifetime follows subscriber interest.
///
/// Cheap to clone; clones share the same store. Must be used from within a
/// Tokio runtime since fetches run as tasks.
#[derive(Clone)]
pub struct ResourceCache {
    shared: Arc<CacheShared>,
}

impl ResourceCache {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        sink: Arc<dyn StateSink>,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                source,
                sink,
                grace: config.resource_grace(),
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                next_timer: AtomicU64::new(0),
            }),
        }
    }

    /// Registers interest in `key`, fetching it unless it is cached or already
    /// loading. A subscriber new to the key retries a previously failed fetch.
    pub fn subscribe_to_resource(&self, key: &str, subscriber: &str) {
        let mut entries = self.shared.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            CacheEntry::new(self.shared.next_generation.fetch_add(1, Ordering::Relaxed) + 1)
        });
        if let Some(timer) = entry.eviction_timer.take() {
            timer.task.abort();
        }
        let added = entry.subscribers.insert(subscriber.to_string());
        let needs_fetch = entry.data.is_none()
            && entry.loading.is_none()
            && (added || entry.last_error.is_none());
        trace!(target: "realtime.cache", key, subscriber, added, needs_fetch, "resource subscribed");
        if needs_fetch {
            let _ = self.shared.start_fetch(key, entry);
        }
    }

    /// Drops `subscriber`'s interest; the last one out purges the entry.
    pub fn unsubscribe_from_resource(&self, key: &str, subscriber: &str) {
        let mut entries = self.shared.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            debug!(target: "realtime.cache", key, subscriber, "unsubscribe for unknown resource");
            return;
        };
        entry.subscribers.remove(subscriber);
        if !entry.subscribers.is_empty() || entry.eviction_timer.is_some() {
            return;
        }
        if self.shared.grace.is_zero() {
            entries.remove(key);
            debug!(target: "realtime.cache", key, "resource evicted");
        } else {
            let generation = entry.generation;
            entry.eviction_timer = Some(self.spawn_eviction_timer(key, generation));
        }
    }

    /// Change notification for `key`. Watched keys drop their data and
    /// refetch; returns whether a fetch was started or queued.
    ///
    /// An entry waiting out its eviction grace period only drops its data,
    /// so a subscriber returning within the window fetches it afresh.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.shared.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            trace!(target: "realtime.cache", key, "change for unknown resource ignored");
            return false;
        };
        entry.data = None;
        entry.last_error = None;
        if entry.subscribers.is_empty() {
            // An in-flight result is stale now; drop it when it lands.
            entry.refetch_pending = entry.loading.is_some();
            debug!(target: "realtime.cache", key, "unwatched resource marked stale");
            return false;
        }
        if entry.loading.is_some() {
            entry.refetch_pending = true;
        } else {
            let _ = self.shared.start_fetch(key, entry);
        }
        debug!(target: "realtime.cache", key, "resource invalidated");
        true
    }

    pub fn get_cached(&self, key: &str) -> Option<Value> {
        self.shared
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.data.clone())
    }

    /// Fetches `key` now, sharing any fetch already in flight. The result is
    /// cached only if the key has an entry; unwatched keys are fetched once
    /// and not stored.
    pub async fn request_resource(&self, key: &str) -> Result<Value, RequestError> {
        let pending = {
            let mut entries = self.shared.entries.lock();
            entries.get_mut(key).map(|entry| match &entry.loading {
                Some(fetch) => fetch.clone(),
                None => self.shared.start_fetch(key, entry),
            })
        };
        match pending {
            Some(fetch) => fetch.await,
            None => {
                debug!(target: "realtime.cache", key, "fetching unwatched resource without caching");
                self.shared.source.fetch(key).await
            }
        }
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.shared
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.loading.is_some())
            .unwrap_or(false)
    }

    pub fn last_error(&self, key: &str) -> Option<RequestError> {
        self.shared
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.shared
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Drops every entry. In-flight fetches complete and are discarded.
    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = {
            let mut entries = self.shared.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            if let Some(timer) = &entry.eviction_timer {
                timer.task.abort();
            }
        }
        debug!(target: "realtime.cache", entries = drained.len(), "resource cache cleared");
    }

    fn spawn_eviction_timer(&self, key: &str, generation: u64) -> EvictionTimer {
        let weak = Arc::downgrade(&self.shared);
        let grace = self.shared.grace;
        let token = self.shared.next_timer.fetch_add(1, Ordering::Relaxed) + 1;
        let key = key.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(shared) = weak.upgrade() {
                shared.evict_after_grace(&key, generation, token);
            }
        });
        EvictionTimer { token, task }
    }
}

impl ChangeListener for ResourceCache {
    fn resource_changed(&self, key: &str) {
        self.invalidate(key);
    }
}
