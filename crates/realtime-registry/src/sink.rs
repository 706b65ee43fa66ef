//! Boundary to the application state that consumes registry output.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::RequestError;
use crate::fanout::PushEvent;
use crate::state::ConnectionState;

/// Command surface of the owning application state. The registry only ever
/// writes through these calls; it never reads application state back.
///
/// Calls are made without any registry lock held, so implementations may call
/// back into the registry.
pub trait StateSink: Send + Sync {
    fn connection_changed(&self, topic: &str, state: &ConnectionState);

    /// The join for `topic` was acknowledged.
    fn session_joined(&self, topic: &str, snapshot: &JoinSnapshot);

    /// The server reported the session behind `topic` as gone; any locally
    /// held reference to it should be dropped.
    fn session_invalidated(&self, topic: &str);

    fn event_received(&self, event: &PushEvent);

    fn resource_loaded(&self, _key: &str, _data: &Value) {}

    fn resource_failed(&self, _key: &str, _error: &RequestError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl StateSink for NoopSink {
    fn connection_changed(&self, _topic: &str, _state: &ConnectionState) {}

    fn session_joined(&self, _topic: &str, _snapshot: &JoinSnapshot) {}

    fn session_invalidated(&self, _topic: &str) {}

    fn event_received(&self, _event: &PushEvent) {}
}

/// Initial state the server returns with a join acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JoinSnapshot {
    /// Messages that were already on the session before this join.
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Everything else in the acknowledgement.
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

impl JoinSnapshot {
    pub fn from_response(response: Value) -> Self {
        match response {
            Value::Object(map) => {
                serde_json::from_value(Value::Object(map.clone())).unwrap_or_else(|err| {
                    warn!(target: "realtime.channel", error = %err, "join response has malformed messages");
                    JoinSnapshot {
                        messages: Vec::new(),
                        state: map,
                    }
                })
            }
            Value::Null => JoinSnapshot::default(),
            other => {
                let mut state = Map::new();
                state.insert("response".to_string(), other);
                JoinSnapshot {
                    messages: Vec::new(),
                    state,
                }
            }
        }
    }
}
