use std::future::Future;
use std::time::Duration;

use channel_transport::{ChannelHandle, Reply};
use serde_json::Value;

use crate::error::{RequestError, ServerError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settled result of one exchange with the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Rejected(ServerError),
    TimedOut,
}

impl Outcome {
    pub fn from_reply(reply: Reply) -> Self {
        match reply {
            Reply::Ok(response) => Outcome::Ok(response),
            Reply::Error(payload) => Outcome::Rejected(ServerError::from_payload(&payload)),
            Reply::Timeout => Outcome::TimedOut,
        }
    }

    pub fn into_result(self) -> Result<Value, RequestError> {
        match self {
            Outcome::Ok(response) => Ok(response),
            Outcome::Rejected(error) => Err(RequestError::Rejected(error)),
            Outcome::TimedOut => Err(RequestError::TimedOut),
        }
    }
}

/// Turns a join or push on a channel into a single [`Outcome`].
///
/// Holds nothing but its timeout window. Concurrent exchanges on the same
/// channel are independent and may settle in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlator {
    window: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Correlator {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn join(&self, handle: &dyn ChannelHandle) -> Outcome {
        self.settle(handle.join()).await
    }

    pub async fn request(&self, handle: &dyn ChannelHandle, event: &str, payload: Value) -> Outcome {
        self.settle(handle.push(event, payload)).await
    }

    async fn settle<F>(&self, reply: F) -> Outcome
    where
        F: Future<Output = Reply>,
    {
        match tokio::time::timeout(self.window, reply).await {
            Ok(reply) => Outcome::from_reply(reply),
            Err(_) => Outcome::TimedOut,
        }
    }
}
