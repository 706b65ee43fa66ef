//! Reference-counted registry of real-time channels with a
//! subscription-scoped resource cache.
//!
//! Many independent consumers can express interest in the same topic while
//! only one underlying channel is opened and joined. Server pushes are routed
//! to a [`StateSink`], and update events naming a resource invalidate it in the
//! [`ResourceCache`] when someone is watching that resource.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use channel_transport::LocalTransport;
//! use realtime_registry::{ChannelSource, NoopSink, RealtimeSession, RegistryConfig};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let config = RegistryConfig::from_env();
//! let transport = LocalTransport::new();
//! let lobby = {
//!     use channel_transport::Transport;
//!     transport.open("lobby", &json!({}))
//! };
//! let session = RealtimeSession::new(
//!     Arc::new(transport),
//!     Arc::new(NoopSink),
//!     Arc::new(ChannelSource::new(lobby, &config)),
//!     &config,
//! );
//!
//! session.channels().subscribe("chat:42", "sidebar", json!({ "session_id": 42 }));
//! session.channels().wait_for_join("chat:42").await;
//! session.resources().subscribe_to_resource("run-7", "sidebar");
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod correlator;
pub mod error;
pub mod fanout;
pub mod multiplexer;
pub mod session;
pub mod sink;
pub mod state;

pub use cache::{ChannelSource, ResourceCache, ResourceSource};
pub use config::RegistryConfig;
pub use correlator::{Correlator, Outcome};
pub use error::{ErrorKind, RegistryError, RegistryResult, RequestError, ServerError};
pub use fanout::{ChangeListener, EventCategory, EventRouting, PushEvent};
pub use multiplexer::ChannelMultiplexer;
pub use session::RealtimeSession;
pub use sink::{JoinSnapshot, NoopSink, StateSink};
pub use state::{ChannelStatus, ConnectionState, ResourceKey, SubscriberId, Topic};
