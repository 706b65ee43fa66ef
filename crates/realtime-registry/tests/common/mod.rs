#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use realtime_registry::{
    ConnectionState, JoinSnapshot, PushEvent, RequestError, StateSink,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Connection { topic: String, state: ConnectionState },
    Joined { topic: String, snapshot: JoinSnapshot },
    Invalidated { topic: String },
    Pushed(PushEvent),
    Loaded { key: String, data: Value },
    Failed { key: String, error: RequestError },
}

/// Records every sink call and streams it to the test.
pub struct RecordingSink {
    log: Mutex<Vec<SinkEvent>>,
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            log: Mutex::new(Vec::new()),
            tx,
        });
        (sink, rx)
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.log.lock().clone()
    }

    /// Connection states reported for `topic`, oldest first.
    pub fn states(&self, topic: &str) -> Vec<ConnectionState> {
        self.log
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Connection { topic: t, state } if t == topic => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn loads(&self, key: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Loaded { key: k, data } if k == key => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: SinkEvent) {
        self.log.lock().push(event.clone());
        let _ = self.tx.send(event);
    }
}

impl StateSink for RecordingSink {
    fn connection_changed(&self, topic: &str, state: &ConnectionState) {
        self.record(SinkEvent::Connection {
            topic: topic.to_string(),
            state: state.clone(),
        });
    }

    fn session_joined(&self, topic: &str, snapshot: &JoinSnapshot) {
        self.record(SinkEvent::Joined {
            topic: topic.to_string(),
            snapshot: snapshot.clone(),
        });
    }

    fn session_invalidated(&self, topic: &str) {
        self.record(SinkEvent::Invalidated {
            topic: topic.to_string(),
        });
    }

    fn event_received(&self, event: &PushEvent) {
        self.record(SinkEvent::Pushed(event.clone()));
    }

    fn resource_loaded(&self, key: &str, data: &Value) {
        self.record(SinkEvent::Loaded {
            key: key.to_string(),
            data: data.clone(),
        });
    }

    fn resource_failed(&self, key: &str, error: &RequestError) {
        self.record(SinkEvent::Failed {
            key: key.to_string(),
            error: error.clone(),
        });
    }
}

/// Waits for the next sink event accepted by `matches`, skipping others.
pub async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<SinkEvent>, mut matches: F) -> SinkEvent
where
    F: FnMut(&SinkEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("sink dropped"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("sink event did not arrive")
}

/// Lets spawned tasks on the current-thread runtime run to their next await.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
