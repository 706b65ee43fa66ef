//! Reference-counted channel registry.
//!
//! One [`ChannelEntry`] per topic, shared by every subscriber of that topic.
//! The first subscriber opens and joins the channel; later subscribers attach
//! to the existing entry. When the last subscriber leaves, teardown is
//! deferred by a grace period so a quick resubscribe keeps the joined channel.
//!
//! All registry mutations happen under one lock and commit before any side
//! effect (sink calls, handler removal, leaving the channel) runs, so sinks and
//! push handlers may call back into the multiplexer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use channel_transport::{ChannelHandle, Transport};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::correlator::{Correlator, Outcome};
use crate::error::{RegistryError, RegistryResult};
use crate::fanout::{ChangeListener, EventRouting, HandlerSet};
use crate::sink::{JoinSnapshot, StateSink};
use crate::state::{ChannelStatus, ConnectionState, SubscriberId};

struct ChannelEntry {
    generation: u64,
    handle: Arc<dyn ChannelHandle>,
    subscribers: HashSet<SubscriberId>,
    status: ChannelStatus,
    last_error: Option<String>,
    context: Value,
    cleanup_timer: Option<CleanupTimer>,
    handlers: HandlerSet,
    status_tx: watch::Sender<ChannelStatus>,
}

impl ChannelEntry {
    fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_status(self.status, self.last_error.as_deref())
    }

    fn set_status(&mut self, status: ChannelStatus, error: Option<String>) {
        self.status = status;
        self.last_error = error;
        self.status_tx.send_replace(status);
    }

    fn cancel_cleanup(&mut self) -> bool {
        match self.cleanup_timer.take() {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }
}

/// Pending grace-period teardown. The token tells a timer that already
/// fired apart from one armed after it.
struct CleanupTimer {
    token: u64,
    task: JoinHandle<()>,
}

/// An entry removed from the registry whose transport teardown is still due.
struct Retired {
    topic: String,
    generation: u64,
    handle: Arc<dyn ChannelHandle>,
    handlers: HandlerSet,
    cleanup_timer: Option<CleanupTimer>,
}

impl Retired {
    fn new(topic: String, entry: ChannelEntry) -> Self {
        Self {
            topic,
            generation: entry.generation,
            handle: entry.handle,
            handlers: entry.handlers,
            cleanup_timer: entry.cleanup_timer,
        }
    }
}

enum JoinEffect {
    Joined(JoinSnapshot),
    Failed { reason: String, session_gone: bool },
}

struct Shared {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn StateSink>,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
    correlator: Correlator,
    grace: Duration,
    send_event: String,
    routing: EventRouting,
    entries: Mutex<HashMap<String, ChannelEntry>>,
    next_generation: AtomicU64,
    next_timer: AtomicU64,
}

impl Shared {
    fn retire(&self, retired: Retired) {
        if let Some(timer) = retired.cleanup_timer {
            timer.task.abort();
        }
        retired.handlers.detach(retired.handle.as_ref());
        retired.handle.leave();
        info!(
            target: "realtime.channel",
            topic = %retired.topic,
            generation = retired.generation,
            "left channel"
        );
        self.sink
            .connection_changed(&retired.topic, &ConnectionState::Idle);
    }

    fn finish_join(&self, topic: &str, generation: u64, outcome: Outcome) {
        let effect = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries
                .get_mut(topic)
                .filter(|entry| entry.generation == generation)
            else {
                debug!(target: "realtime.channel", topic, generation, "discarding join outcome for retired entry");
                return;
            };
            match outcome {
                Outcome::Ok(response) => {
                    entry.set_status(ChannelStatus::Connected, None);
                    JoinEffect::Joined(JoinSnapshot::from_response(response))
                }
                Outcome::Rejected(error) => {
                    let reason = error.reason();
                    entry.set_status(ChannelStatus::Error, Some(reason.clone()));
                    JoinEffect::Failed {
                        reason,
                        session_gone: error.is_session_gone(),
                    }
                }
                Outcome::TimedOut => {
                    let reason = format!("timed out joining {topic}");
                    entry.set_status(ChannelStatus::Error, Some(reason.clone()));
                    JoinEffect::Failed {
                        reason,
                        session_gone: false,
                    }
                }
            }
        };

        match effect {
            JoinEffect::Joined(snapshot) => {
                info!(
                    target: "realtime.channel",
                    topic,
                    generation,
                    messages = snapshot.messages.len(),
                    "channel joined"
                );
                self.sink
                    .connection_changed(topic, &ConnectionState::Connected);
                self.sink.session_joined(topic, &snapshot);
            }
            JoinEffect::Failed {
                reason,
                session_gone,
            } => {
                warn!(
                    target: "realtime.channel",
                    topic,
                    generation,
                    error = %reason,
                    session_gone,
                    "channel join failed"
                );
                self.sink
                    .connection_changed(topic, &ConnectionState::Error(reason));
                if session_gone {
                    self.sink.session_invalidated(topic);
                }
            }
        }
    }

    fn cleanup_after_grace(&self, topic: &str, generation: u64, token: u64) {
        let retired = {
            let mut entries = self.entries.lock();
            match entries.get_mut(topic) {
                Some(entry)
                    if entry.generation == generation
                        && entry.cleanup_timer.as_ref().map(|timer| timer.token) == Some(token) =>
                {
                    // This task is the timer; detach rather than abort it.
                    entry.cleanup_timer = None;
                    if !entry.subscribers.is_empty() {
                        debug!(target: "realtime.channel", topic, generation, "resubscribed during grace period");
                        return;
                    }
                }
                _ => return,
            }
            entries
                .remove(topic)
                .map(|entry| Retired::new(topic.to_string(), entry))
        };
        if let Some(retired) = retired {
            self.retire(retired);
        }
    }
}

/// Shares one joined channel per topic between any number of subscribers.
///
/// Cheap to clone; clones refer to the same registry. Must be used from
/// within a Tokio runtime since joins and grace timers run as tasks.
#[derive(Clone)]
pub struct ChannelMultiplexer {
    shared: Arc<Shared>,
}

impl ChannelMultiplexer {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn StateSink>,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                sink,
                listener: RwLock::new(None),
                correlator: Correlator::new(config.request_timeout()),
                grace: config.channel_grace(),
                send_event: config.send_event.clone(),
                routing: config.routing(),
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                next_timer: AtomicU64::new(0),
            }),
        }
    }

    /// Routes resource change notifications from update events of channels
    /// opened after this call.
    pub fn set_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.shared.listener.write() = Some(listener);
    }

    /// Registers `subscriber` for `topic`, opening and joining the channel if
    /// this is the first interest in it. `context` is used as join parameters
    /// only when the channel is created.
    pub fn subscribe(&self, topic: &str, subscriber: &str, context: Value) {
        loop {
            if self.attach_existing(topic, subscriber) {
                return;
            }

            // Built unlocked: transports may call back from `open` or `on`.
            let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
            let handle = self.shared.transport.open(topic, &context);
            let listener = self.shared.listener.read().clone();
            let handlers = HandlerSet::attach(
                handle.as_ref(),
                &self.shared.routing,
                Arc::clone(&self.shared.sink),
                listener,
            );

            let mut entries = self.shared.entries.lock();
            if entries.contains_key(topic) {
                drop(entries);
                debug!(target: "realtime.channel", topic, generation, "lost race to open channel, discarding");
                handlers.detach(handle.as_ref());
                handle.leave();
                continue;
            }
            let (status_tx, _) = watch::channel(ChannelStatus::Connecting);
            let mut subscribers = HashSet::new();
            subscribers.insert(subscriber.to_string());
            entries.insert(
                topic.to_string(),
                ChannelEntry {
                    generation,
                    handle: Arc::clone(&handle),
                    subscribers,
                    status: ChannelStatus::Connecting,
                    last_error: None,
                    context,
                    cleanup_timer: None,
                    handlers,
                    status_tx,
                },
            );
            drop(entries);

            info!(target: "realtime.channel", topic, subscriber, generation, "opening channel");
            self.shared
                .sink
                .connection_changed(topic, &ConnectionState::Connecting);

            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let correlator = self.shared.correlator;
            let topic = topic.to_string();
            tokio::spawn(async move {
                let outcome = correlator.join(handle.as_ref()).await;
                if let Some(shared) = weak.upgrade() {
                    shared.finish_join(&topic, generation, outcome);
                }
            });
            return;
        }
    }

    /// Adds `subscriber` to an existing entry and reports its current state.
    /// Returns `false` when there is no entry for `topic`.
    fn attach_existing(&self, topic: &str, subscriber: &str) -> bool {
        let mut entries = self.shared.entries.lock();
        let Some(entry) = entries.get_mut(topic) else {
            return false;
        };
        let resumed = entry.cancel_cleanup();
        let added = entry.subscribers.insert(subscriber.to_string());
        let state = entry.connection_state();
        let generation = entry.generation;
        drop(entries);

        debug!(
            target: "realtime.channel",
            topic,
            subscriber,
            generation,
            added,
            resumed,
            "attached to existing channel"
        );
        self.shared.sink.connection_changed(topic, &state);
        true
    }

    /// Drops `subscriber`'s interest. The channel is left once the grace
    /// period passes without anyone subscribing again.
    pub fn unsubscribe(&self, topic: &str, subscriber: &str) {
        let retired = {
            let mut entries = self.shared.entries.lock();
            let Some(entry) = entries.get_mut(topic) else {
                warn!(target: "realtime.channel", topic, subscriber, "unsubscribe for unknown topic");
                return;
            };
            if !entry.subscribers.remove(subscriber) {
                debug!(target: "realtime.channel", topic, subscriber, "subscriber was not registered");
            }
            if !entry.subscribers.is_empty() || entry.cleanup_timer.is_some() {
                return;
            }
            // Failed joins are terminal; a resubscribe has to rejoin.
            if self.shared.grace.is_zero() || entry.status == ChannelStatus::Error {
                entries
                    .remove(topic)
                    .map(|entry| Retired::new(topic.to_string(), entry))
            } else {
                entry.cleanup_timer = Some(self.spawn_cleanup_timer(topic, entry.generation));
                debug!(
                    target: "realtime.channel",
                    topic,
                    grace_ms = u64::try_from(self.shared.grace.as_millis()).unwrap_or(u64::MAX),
                    "last subscriber left, cleanup scheduled"
                );
                None
            }
        };
        if let Some(retired) = retired {
            self.shared.retire(retired);
        }
    }

    /// Like [`unsubscribe`](Self::unsubscribe) but leaves the channel right
    /// away when no subscribers remain.
    pub fn unsubscribe_immediate(&self, topic: &str, subscriber: &str) {
        let retired = {
            let mut entries = self.shared.entries.lock();
            let Some(entry) = entries.get_mut(topic) else {
                warn!(target: "realtime.channel", topic, subscriber, "unsubscribe for unknown topic");
                return;
            };
            entry.subscribers.remove(subscriber);
            if !entry.subscribers.is_empty() {
                return;
            }
            entries
                .remove(topic)
                .map(|entry| Retired::new(topic.to_string(), entry))
        };
        if let Some(retired) = retired {
            self.shared.retire(retired);
        }
    }

    /// Tears down the channel for `topic` unless it has subscribers. Returns
    /// whether the channel was left.
    pub fn cleanup(&self, topic: &str) -> bool {
        let retired = {
            let mut entries = self.shared.entries.lock();
            match entries.get(topic).map(|entry| entry.subscribers.len()) {
                None => {
                    debug!(target: "realtime.channel", topic, "cleanup for unknown topic");
                    return false;
                }
                Some(subscribers) if subscribers > 0 => {
                    debug!(
                        target: "realtime.channel",
                        topic,
                        subscribers,
                        "cleanup skipped, channel still has subscribers"
                    );
                    return false;
                }
                Some(_) => entries
                    .remove(topic)
                    .map(|entry| Retired::new(topic.to_string(), entry)),
            }
        };
        match retired {
            Some(retired) => {
                self.shared.retire(retired);
                true
            }
            None => false,
        }
    }

    /// Leaves every channel and empties the registry.
    pub fn destroy(&self) {
        let retired: Vec<Retired> = {
            let mut entries = self.shared.entries.lock();
            entries
                .drain()
                .map(|(topic, entry)| Retired::new(topic, entry))
                .collect()
        };
        info!(target: "realtime.channel", channels = retired.len(), "destroying channel registry");
        for retired in retired {
            self.shared.retire(retired);
        }
    }

    /// Sends `payload` as the configured message event on a joined channel.
    pub async fn send_message(&self, topic: &str, payload: Value) -> RegistryResult<Value> {
        let event = self.shared.send_event.clone();
        self.request(topic, &event, payload).await
    }

    /// Performs one request/response exchange on a joined channel.
    pub async fn request(&self, topic: &str, event: &str, payload: Value) -> RegistryResult<Value> {
        let handle = {
            let entries = self.shared.entries.lock();
            let Some(entry) = entries.get(topic) else {
                warn!(target: "realtime.channel", topic, event, "request on unknown topic");
                return Err(RegistryError::UnknownTopic(topic.to_string()));
            };
            if entry.status != ChannelStatus::Connected {
                return Err(RegistryError::NotConnected {
                    topic: topic.to_string(),
                    status: entry.status,
                });
            }
            Arc::clone(&entry.handle)
        };

        self.shared
            .correlator
            .request(handle.as_ref(), event, payload)
            .await
            .into_result()
            .map_err(|err| {
                warn!(target: "realtime.channel", topic, event, error = %err, "request failed");
                RegistryError::from(err)
            })
    }

    pub fn get_channel_status(&self, topic: &str) -> Option<ChannelStatus> {
        self.shared.entries.lock().get(topic).map(|entry| entry.status)
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriber_count(topic) > 0
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .entries
            .lock()
            .get(topic)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.entries.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Reason of the failed join, if the channel is in `Error`.
    pub fn last_error(&self, topic: &str) -> Option<String> {
        self.shared
            .entries
            .lock()
            .get(topic)
            .and_then(|entry| entry.last_error.clone())
    }

    /// Join parameters the channel was opened with.
    pub fn context(&self, topic: &str) -> Option<Value> {
        self.shared
            .entries
            .lock()
            .get(topic)
            .map(|entry| entry.context.clone())
    }

    /// The live handle for `topic`, e.g. to build a
    /// [`ChannelSource`](crate::cache::ChannelSource) over it.
    pub fn handle(&self, topic: &str) -> Option<Arc<dyn ChannelHandle>> {
        self.shared
            .entries
            .lock()
            .get(topic)
            .map(|entry| Arc::clone(&entry.handle))
    }

    pub fn watch_status(&self, topic: &str) -> Option<watch::Receiver<ChannelStatus>> {
        self.shared
            .entries
            .lock()
            .get(topic)
            .map(|entry| entry.status_tx.subscribe())
    }

    /// Resolves once the join for `topic` has settled. `None` if there is no
    /// entry or it was torn down first.
    pub async fn wait_for_join(&self, topic: &str) -> Option<ChannelStatus> {
        let mut rx = self.watch_status(topic)?;
        let status = rx
            .wait_for(|status| *status != ChannelStatus::Connecting)
            .await
            .ok()
            .map(|status| *status);
        status
    }

    fn spawn_cleanup_timer(&self, topic: &str, generation: u64) -> CleanupTimer {
        let weak = Arc::downgrade(&self.shared);
        let grace = self.shared.grace;
        let token = self.shared.next_timer.fetch_add(1, Ordering::Relaxed) + 1;
        let topic = topic.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(shared) = weak.upgrade() {
                shared.cleanup_after_grace(&topic, generation, token);
            }
        });
        CleanupTimer { token, task }
    }
}
