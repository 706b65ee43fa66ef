//! Server-push handler bookkeeping for channel entries.
//!
//! Every entry registers its handlers once, at creation, and keeps the
//! [`HandlerRef`] of each so teardown removes exactly those callbacks and
//! nothing registered by a later entry for the same topic.

use std::sync::Arc;

use channel_transport::{ChannelHandle, EventCallback, HandlerRef};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::sink::StateSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// New application data: a message, a status change.
    Update,
    /// Changes to the session itself.
    Structural,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub topic: String,
    pub event: String,
    pub category: EventCategory,
    pub payload: Value,
}

impl PushEvent {
    /// Resource named by the payload's `field`, if any. Numeric ids are
    /// accepted and rendered as strings.
    pub fn resource_key(&self, field: &str) -> Option<String> {
        match self.payload.get(field)? {
            Value::String(key) if !key.is_empty() => Some(key.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

/// Receives change notifications for resources named by update events.
pub trait ChangeListener: Send + Sync {
    fn resource_changed(&self, key: &str);
}

/// Which push events an entry listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRouting {
    pub update_events: Vec<String>,
    pub structural_events: Vec<String>,
    /// Payload field of update events that names the affected resource.
    pub resource_key_field: String,
}

impl Default for EventRouting {
    fn default() -> Self {
        Self {
            update_events: vec!["new_message".to_string(), "status_changed".to_string()],
            structural_events: vec!["session_updated".to_string()],
            resource_key_field: "resource_id".to_string(),
        }
    }
}

/// Handlers one channel entry registered, in registration order.
#[derive(Debug)]
pub struct HandlerSet {
    topic: String,
    registrations: Vec<(String, HandlerRef)>,
}

impl HandlerSet {
    pub fn attach(
        handle: &dyn ChannelHandle,
        routing: &EventRouting,
        sink: Arc<dyn StateSink>,
        listener: Option<Arc<dyn ChangeListener>>,
    ) -> Self {
        let topic = handle.topic().to_string();
        let categories = routing
            .update_events
            .iter()
            .map(|event| (event, EventCategory::Update))
            .chain(
                routing
                    .structural_events
                    .iter()
                    .map(|event| (event, EventCategory::Structural)),
            );

        let mut registrations = Vec::new();
        for (event, category) in categories {
            let callback = route(
                topic.clone(),
                event.clone(),
                category,
                Arc::clone(&sink),
                listener.clone(),
                routing.resource_key_field.clone(),
            );
            let handler = handle.on(event, callback);
            registrations.push((event.clone(), handler));
        }
        debug!(target: "realtime.fanout", topic = %topic, handlers = registrations.len(), "attached push handlers");
        Self {
            topic,
            registrations,
        }
    }

    pub fn detach(self, handle: &dyn ChannelHandle) {
        let count = self.registrations.len();
        for (event, handler) in self.registrations {
            handle.off(&event, handler);
        }
        debug!(target: "realtime.fanout", topic = %self.topic, handlers = count, "detached push handlers");
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

fn route(
    topic: String,
    event: String,
    category: EventCategory,
    sink: Arc<dyn StateSink>,
    listener: Option<Arc<dyn ChangeListener>>,
    key_field: String,
) -> EventCallback {
    Arc::new(move |payload: &Value| {
        let push = PushEvent {
            topic: topic.clone(),
            event: event.clone(),
            category,
            payload: payload.clone(),
        };
        trace!(target: "realtime.fanout", topic = %push.topic, event = %push.event, "push received");
        sink.event_received(&push);

        if category != EventCategory::Update {
            return;
        }
        if let (Some(listener), Some(key)) = (listener.as_ref(), push.resource_key(&key_field)) {
            listener.resource_changed(&key);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::JoinSnapshot;
    use crate::state::ConnectionState;
    use channel_transport::{LocalTransport, Transport};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<PushEvent>>,
        changed: Mutex<Vec<String>>,
    }

    impl StateSink for Collector {
        fn connection_changed(&self, _topic: &str, _state: &ConnectionState) {}
        fn session_joined(&self, _topic: &str, _snapshot: &JoinSnapshot) {}
        fn session_invalidated(&self, _topic: &str) {}
        fn event_received(&self, event: &PushEvent) {
            self.events.lock().push(event.clone());
        }
    }

    impl ChangeListener for Collector {
        fn resource_changed(&self, key: &str) {
            self.changed.lock().push(key.to_string());
        }
    }

    #[test]
    fn routes_categories_and_resource_keys() {
        let transport = LocalTransport::new();
        let handle = transport.open("runs:7", &json!({}));
        let collector = Arc::new(Collector::default());
        let listener: Arc<dyn ChangeListener> = collector.clone();
        let set = HandlerSet::attach(
            handle.as_ref(),
            &EventRouting::default(),
            collector.clone(),
            Some(listener),
        );
        assert_eq!(set.len(), 3);

        transport
            .emit("runs:7", "status_changed", json!({ "resource_id": "r1" }))
            .unwrap();
        transport
            .emit("runs:7", "session_updated", json!({ "resource_id": "r2" }))
            .unwrap();
        transport
            .emit("runs:7", "new_message", json!({ "resource_id": 12 }))
            .unwrap();

        let events = collector.events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].category, EventCategory::Update);
        assert_eq!(events[1].category, EventCategory::Structural);
        assert_eq!(collector.changed.lock().as_slice(), ["r1", "12"]);
    }

    #[test]
    fn detach_removes_exactly_the_registered_handlers() {
        let transport = LocalTransport::new();
        let handle = transport.open("chat:1", &json!({}));
        let foreign = handle.on("new_message", Arc::new(|_| {}));
        let set = HandlerSet::attach(
            handle.as_ref(),
            &EventRouting::default(),
            Arc::new(crate::sink::NoopSink),
            None,
        );

        set.detach(handle.as_ref());

        let stats = transport.handler_stats("chat:1", "new_message");
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.deregistered, 1);
        assert_eq!(stats.active, 1);
        handle.off("new_message", foreign);
        assert_eq!(transport.handler_stats("chat:1", "new_message").active, 0);
    }
}
