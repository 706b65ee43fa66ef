//! In-memory transport for tests.
//!
//! Replies are scripted per topic (joins) or per event (pushes) and can be
//! either immediate or deferred behind a oneshot so callers can observe the
//! in-flight window. Every interaction is recorded in a ledger that grows for
//! the lifetime of the transport; left channels are dropped from the live set.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    ChannelHandle, EventCallback, HandlerRef, Payload, Reply, Transport, TransportError,
    TransportResult,
};

type Responder = Arc<dyn Fn(&Payload) -> Reply + Send + Sync>;

enum Scripted {
    Ready(Reply),
    Deferred(oneshot::Receiver<Reply>),
}

impl Scripted {
    async fn resolve(self) -> Reply {
        match self {
            Scripted::Ready(reply) => reply,
            // A dropped sender means the server never answered.
            Scripted::Deferred(rx) => rx.await.unwrap_or(Reply::Timeout),
        }
    }
}

/// Registration counters for one event name on one topic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    pub registered: usize,
    pub deregistered: usize,
    pub active: usize,
    pub peak_active: usize,
}

#[derive(Default)]
struct Script {
    joins: HashMap<String, VecDeque<Scripted>>,
    pushes: HashMap<String, VecDeque<Scripted>>,
    responders: HashMap<String, Responder>,
}

#[derive(Default)]
struct Ledger {
    opens: HashMap<String, usize>,
    joins: HashMap<String, usize>,
    leaves: HashMap<String, usize>,
    params: HashMap<String, Payload>,
    pushes: Vec<(String, String, Payload)>,
    handlers: HashMap<(String, String), HandlerStats>,
}

#[derive(Default)]
struct Shared {
    script: Mutex<Script>,
    ledger: Mutex<Ledger>,
    channels: Mutex<HashMap<String, Vec<Arc<LocalChannel>>>>,
    next_handler: AtomicU64,
}

#[derive(Clone, Default)]
pub struct LocalTransport {
    shared: Arc<Shared>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the reply for the next join on `topic`. Unscripted joins succeed
    /// with an empty object.
    pub fn script_join(&self, topic: &str, reply: Reply) {
        self.shared
            .script
            .lock()
            .joins
            .entry(topic.to_string())
            .or_default()
            .push_back(Scripted::Ready(reply));
    }

    /// Holds the next join on `topic` until the returned sender fires.
    pub fn defer_join(&self, topic: &str) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .script
            .lock()
            .joins
            .entry(topic.to_string())
            .or_default()
            .push_back(Scripted::Deferred(rx));
        tx
    }

    pub fn script_push(&self, event: &str, reply: Reply) {
        self.shared
            .script
            .lock()
            .pushes
            .entry(event.to_string())
            .or_default()
            .push_back(Scripted::Ready(reply));
    }

    pub fn defer_push(&self, event: &str) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .script
            .lock()
            .pushes
            .entry(event.to_string())
            .or_default()
            .push_back(Scripted::Deferred(rx));
        tx
    }

    /// Answers every unscripted push of `event` by calling `responder`.
    pub fn respond_with<F>(&self, event: &str, responder: F)
    where
        F: Fn(&Payload) -> Reply + Send + Sync + 'static,
    {
        self.shared
            .script
            .lock()
            .responders
            .insert(event.to_string(), Arc::new(responder));
    }

    /// Delivers a server push to the live channel for `topic`. Returns how
    /// many callbacks ran.
    pub fn emit(&self, topic: &str, event: &str, payload: Payload) -> TransportResult<usize> {
        let channel = {
            let channels = self.shared.channels.lock();
            channels
                .get(topic)
                .and_then(|list| list.iter().rev().find(|c| !c.is_left()).cloned())
        };
        let channel = channel.ok_or_else(|| TransportError::NoChannel(topic.to_string()))?;
        channel.dispatch(event, &payload)
    }

    pub fn open_count(&self, topic: &str) -> usize {
        self.shared.ledger.lock().opens.get(topic).copied().unwrap_or(0)
    }

    pub fn join_count(&self, topic: &str) -> usize {
        self.shared.ledger.lock().joins.get(topic).copied().unwrap_or(0)
    }

    pub fn leave_count(&self, topic: &str) -> usize {
        self.shared.ledger.lock().leaves.get(topic).copied().unwrap_or(0)
    }

    pub fn push_count(&self, event: &str) -> usize {
        self.shared
            .ledger
            .lock()
            .pushes
            .iter()
            .filter(|(_, name, _)| name == event)
            .count()
    }

    /// Every push seen so far as `(topic, event, payload)`.
    pub fn pushes(&self) -> Vec<(String, String, Payload)> {
        self.shared.ledger.lock().pushes.clone()
    }

    /// Join parameters of the most recent open for `topic`.
    pub fn join_params(&self, topic: &str) -> Option<Payload> {
        self.shared.ledger.lock().params.get(topic).cloned()
    }

    /// Channels for `topic` that have not been left.
    pub fn live_channels(&self, topic: &str) -> usize {
        self.shared
            .channels
            .lock()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn handler_stats(&self, topic: &str, event: &str) -> HandlerStats {
        self.shared
            .ledger
            .lock()
            .handlers
            .get(&(topic.to_string(), event.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

impl Transport for LocalTransport {
    fn open(&self, topic: &str, params: &Payload) -> Arc<dyn ChannelHandle> {
        {
            let mut ledger = self.shared.ledger.lock();
            *ledger.opens.entry(topic.to_string()).or_default() += 1;
            ledger.params.insert(topic.to_string(), params.clone());
        }
        let channel = Arc::new(LocalChannel {
            topic: topic.to_string(),
            shared: Arc::clone(&self.shared),
            state: Mutex::new(ChannelState::default()),
        });
        self.shared
            .channels
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&channel));
        channel
    }
}

#[derive(Default)]
struct ChannelState {
    handlers: Vec<(String, HandlerRef, EventCallback)>,
    left: bool,
}

pub struct LocalChannel {
    topic: String,
    shared: Arc<Shared>,
    state: Mutex<ChannelState>,
}

impl LocalChannel {
    fn is_left(&self) -> bool {
        self.state.lock().left
    }

    fn dispatch(&self, event: &str, payload: &Payload) -> TransportResult<usize> {
        let callbacks: Vec<EventCallback> = {
            let state = self.state.lock();
            if state.left {
                return Err(TransportError::Left(self.topic.clone()));
            }
            state
                .handlers
                .iter()
                .filter(|(name, _, _)| name == event)
                .map(|(_, _, callback)| Arc::clone(callback))
                .collect()
        };
        // Callbacks run unlocked so they may register or remove handlers.
        for callback in &callbacks {
            callback(payload);
        }
        Ok(callbacks.len())
    }

    fn stats_mut<'a>(ledger: &'a mut Ledger, topic: &str, event: &str) -> &'a mut HandlerStats {
        ledger
            .handlers
            .entry((topic.to_string(), event.to_string()))
            .or_default()
    }
}

#[async_trait]
impl ChannelHandle for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn join(&self) -> Reply {
        let scripted = {
            *self
                .shared
                .ledger
                .lock()
                .joins
                .entry(self.topic.clone())
                .or_default() += 1;
            self.shared
                .script
                .lock()
                .joins
                .get_mut(&self.topic)
                .and_then(VecDeque::pop_front)
        };
        match scripted {
            Some(scripted) => scripted.resolve().await,
            None => Reply::Ok(json!({})),
        }
    }

    fn on(&self, event: &str, callback: EventCallback) -> HandlerRef {
        let handler = HandlerRef::new(self.shared.next_handler.fetch_add(1, Ordering::Relaxed) + 1);
        self.state
            .lock()
            .handlers
            .push((event.to_string(), handler, callback));
        let mut ledger = self.shared.ledger.lock();
        let stats = Self::stats_mut(&mut ledger, &self.topic, event);
        stats.registered += 1;
        stats.active += 1;
        stats.peak_active = stats.peak_active.max(stats.active);
        handler
    }

    fn off(&self, event: &str, handler: HandlerRef) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.handlers.len();
            state
                .handlers
                .retain(|(name, id, _)| !(name == event && *id == handler));
            before != state.handlers.len()
        };
        if !removed {
            debug!(target: "realtime.transport", topic = %self.topic, event, handler = handler.raw(), "off for unknown handler");
            return;
        }
        let mut ledger = self.shared.ledger.lock();
        let stats = Self::stats_mut(&mut ledger, &self.topic, event);
        stats.deregistered += 1;
        stats.active = stats.active.saturating_sub(1);
    }

    async fn push(&self, event: &str, payload: Payload) -> Reply {
        if self.is_left() {
            return Reply::Error(json!({ "reason": "channel closed" }));
        }
        let (scripted, responder) = {
            self.shared.ledger.lock().pushes.push((
                self.topic.clone(),
                event.to_string(),
                payload.clone(),
            ));
            let mut script = self.shared.script.lock();
            let scripted = script.pushes.get_mut(event).and_then(VecDeque::pop_front);
            (scripted, script.responders.get(event).cloned())
        };
        match (scripted, responder) {
            (Some(scripted), _) => scripted.resolve().await,
            (None, Some(responder)) => responder(&payload),
            (None, None) => Reply::Ok(json!({})),
        }
    }

    fn leave(&self) {
        self.state.lock().left = true;
        {
            let mut channels = self.shared.channels.lock();
            if let Some(list) = channels.get_mut(&self.topic) {
                list.retain(|channel| !std::ptr::eq(Arc::as_ptr(channel), self));
                if list.is_empty() {
                    channels.remove(&self.topic);
                }
            }
        }
        *self
            .shared
            .ledger
            .lock()
            .leaves
            .entry(self.topic.clone())
            .or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn emit_reaches_registered_handlers() {
        let transport = LocalTransport::new();
        let channel = transport.open("chat:1", &json!({ "user": "x" }));
        let seen: Arc<StdMutex<Vec<Payload>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on(
            "new_message",
            Arc::new(move |payload| sink.lock().unwrap().push(payload.clone())),
        );

        let delivered = transport
            .emit("chat:1", "new_message", json!({ "body": "hi" }))
            .expect("emit ok");
        assert_eq!(delivered, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), [json!({ "body": "hi" })]);
        assert_eq!(transport.join_params("chat:1"), Some(json!({ "user": "x" })));
    }

    #[tokio::test]
    async fn off_removes_only_the_given_handler() {
        let transport = LocalTransport::new();
        let channel = transport.open("chat:1", &json!({}));
        let first = channel.on("status_changed", Arc::new(|_| {}));
        let _second = channel.on("status_changed", Arc::new(|_| {}));

        channel.off("status_changed", first);
        channel.off("status_changed", first);

        let stats = transport.handler_stats("chat:1", "status_changed");
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.deregistered, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.peak_active, 2);
        assert_eq!(
            transport.emit("chat:1", "status_changed", json!({})).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn deferred_join_waits_for_the_script() {
        let transport = LocalTransport::new();
        let release = transport.defer_join("chat:2");
        let channel = transport.open("chat:2", &json!({}));

        let pending = tokio::spawn(async move { channel.join().await });
        release
            .send(Reply::Error(json!({ "reason": "unauthorized" })))
            .expect("receiver alive");

        let reply = pending.await.expect("join task");
        assert_eq!(reply, Reply::Error(json!({ "reason": "unauthorized" })));
        assert_eq!(transport.join_count("chat:2"), 1);
    }

    #[tokio::test]
    async fn left_channels_stop_receiving() {
        let transport = LocalTransport::new();
        let channel = transport.open("chat:3", &json!({}));
        channel.on("new_message", Arc::new(|_| {}));
        channel.leave();

        assert!(matches!(
            transport.emit("chat:3", "new_message", json!({})),
            Err(TransportError::NoChannel(_))
        ));
        assert_eq!(transport.leave_count("chat:3"), 1);
        assert!(matches!(
            channel.push("anything", json!({})).await,
            Reply::Error(_)
        ));
    }

    #[tokio::test]
    async fn left_channels_are_pruned() {
        let transport = LocalTransport::new();
        let first = transport.open("chat:4", &json!({}));
        let second = transport.open("chat:4", &json!({}));
        assert_eq!(transport.live_channels("chat:4"), 2);

        second.leave();
        assert_eq!(transport.live_channels("chat:4"), 1);
        assert_eq!(transport.emit("chat:4", "new_message", json!({})).unwrap(), 0);

        first.leave();
        assert_eq!(transport.live_channels("chat:4"), 0);
        assert_eq!(transport.open_count("chat:4"), 2);
        assert_eq!(transport.leave_count("chat:4"), 2);
    }
}
