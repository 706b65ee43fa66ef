use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::ChannelStatus;

/// Field name that carries messages not tied to a specific input field.
pub const BASE_FIELD: &str = "base";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
    #[serde(other)]
    Unknown,
}

impl ErrorKind {
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not found",
            ErrorKind::Validation => "invalid request",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Internal => "internal server error",
            ErrorKind::Unknown => "unknown error",
        }
    }

    fn from_reason(reason: &str) -> Self {
        serde_json::from_value(Value::String(reason.to_string())).unwrap_or(ErrorKind::Unknown)
    }
}

/// Structured rejection produced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{}", self.reason())]
pub struct ServerError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
}

impl ServerError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_message(mut self, field: &str, message: impl Into<String>) -> Self {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push(message.into());
        self
    }

    /// Normalizes whatever the server sent into the structured shape.
    ///
    /// Accepts the structured form itself, a `{ "reason": .. }` object, or a
    /// bare string. Reasons that name a known kind map onto it; anything else
    /// becomes an `Unknown` error carrying the reason as a base message.
    pub fn from_payload(payload: &Value) -> Self {
        if let Ok(error) = serde_json::from_value::<ServerError>(payload.clone()) {
            return error;
        }
        let reason = match payload {
            Value::String(reason) => Some(reason.as_str()),
            Value::Object(map) => map.get("reason").and_then(Value::as_str),
            _ => None,
        };
        match reason {
            Some(reason) => Self::from_reason(reason),
            None => Self::new(ErrorKind::Unknown),
        }
    }

    fn from_reason(reason: &str) -> Self {
        match ErrorKind::from_reason(reason) {
            ErrorKind::Unknown => Self::new(ErrorKind::Unknown).with_message(BASE_FIELD, reason),
            kind => Self::new(kind),
        }
    }

    /// Human-readable reason: base messages first, then `"<field> <message>"`
    /// for every other field.
    pub fn reason(&self) -> String {
        let mut parts: Vec<String> = self
            .fields
            .get(BASE_FIELD)
            .map(|messages| messages.to_vec())
            .unwrap_or_default();
        for (field, messages) in &self.fields {
            if field == BASE_FIELD {
                continue;
            }
            parts.extend(messages.iter().map(|message| format!("{field} {message}")));
        }
        if parts.is_empty() {
            self.kind.description().to_string()
        } else {
            parts.join(", ")
        }
    }

    /// The rejected session no longer exists on the server.
    pub fn is_session_gone(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request rejected: {0}")]
    Rejected(ServerError),
    #[error("request timed out")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no channel registered for topic {0}")]
    UnknownTopic(String),
    #[error("channel {topic} is {status}")]
    NotConnected {
        topic: String,
        status: ChannelStatus,
    },
    #[error(transparent)]
    Request(#[from] RequestError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
