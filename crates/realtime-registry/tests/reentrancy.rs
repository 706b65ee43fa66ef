mod common;

use std::sync::Arc;

use channel_transport::LocalTransport;
use parking_lot::Mutex;
use realtime_registry::{
    ChannelMultiplexer, ChannelStatus, ConnectionState, JoinSnapshot, PushEvent, RegistryConfig,
    StateSink,
};
use serde_json::json;
use test_timeout::tokio_timeout_test;

/// Drives the multiplexer from inside its own sink callbacks.
#[derive(Default)]
struct SteeringSink {
    channels: Mutex<Option<ChannelMultiplexer>>,
    states: Mutex<Vec<(String, ConnectionState)>>,
}

impl SteeringSink {
    fn channels(&self) -> Option<ChannelMultiplexer> {
        self.channels.lock().clone()
    }
}

impl StateSink for SteeringSink {
    fn connection_changed(&self, topic: &str, state: &ConnectionState) {
        self.states.lock().push((topic.to_string(), state.clone()));
        if topic == "chat:1" && *state == ConnectionState::Connected {
            if let Some(channels) = self.channels() {
                channels.subscribe("presence:1", "chat", json!({}));
            }
        }
    }

    fn session_joined(&self, _topic: &str, _snapshot: &JoinSnapshot) {}

    fn session_invalidated(&self, _topic: &str) {}

    fn event_received(&self, event: &PushEvent) {
        if event.event != "session_updated" {
            return;
        }
        if let Some(channels) = self.channels() {
            channels.unsubscribe_immediate(&event.topic, "x");
            channels.subscribe(&event.topic, "y", json!({ "rejoin": true }));
        }
    }
}

fn setup() -> (LocalTransport, Arc<SteeringSink>, ChannelMultiplexer) {
    common::init_tracing();
    let transport = LocalTransport::new();
    let sink = Arc::new(SteeringSink::default());
    let channels = ChannelMultiplexer::new(
        Arc::new(transport.clone()),
        sink.clone(),
        &RegistryConfig::default(),
    );
    *sink.channels.lock() = Some(channels.clone());
    (transport, sink, channels)
}

#[tokio_timeout_test(10, paused)]
async fn push_handler_may_recreate_its_own_channel() {
    let (transport, sink, channels) = setup();

    channels.subscribe("chat:1", "x", json!({}));
    channels.wait_for_join("chat:1").await;
    let delivered = transport
        .emit("chat:1", "session_updated", json!({ "title": "renamed" }))
        .expect("channel is live");
    assert_eq!(delivered, 1);

    assert_eq!(channels.subscriber_count("chat:1"), 1);
    assert_eq!(transport.open_count("chat:1"), 2);
    assert_eq!(transport.leave_count("chat:1"), 1);
    assert_eq!(transport.join_params("chat:1"), Some(json!({ "rejoin": true })));
    assert_eq!(channels.wait_for_join("chat:1").await, Some(ChannelStatus::Connected));
    assert_eq!(transport.join_count("chat:1"), 2);
    assert_eq!(transport.handler_stats("chat:1", "session_updated").active, 1);

    sink.channels.lock().take();
}

#[tokio_timeout_test(10, paused)]
async fn connection_callback_may_subscribe_elsewhere() {
    let (transport, sink, channels) = setup();

    channels.subscribe("chat:1", "x", json!({}));
    channels.wait_for_join("chat:1").await;

    assert_eq!(channels.subscriber_count("presence:1"), 1);
    assert_eq!(transport.open_count("presence:1"), 1);
    assert_eq!(channels.wait_for_join("presence:1").await, Some(ChannelStatus::Connected));
    assert!(sink
        .states
        .lock()
        .contains(&("presence:1".to_string(), ConnectionState::Connecting)));

    sink.channels.lock().take();
}
