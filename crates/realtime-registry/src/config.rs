use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::fanout::EventRouting;

/// Registry configuration. Every field has a default, so an empty
/// environment yields a working config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryConfig {
    /// Delay between a channel losing its last subscriber and leaving it.
    #[serde(default = "default_channel_grace_ms")]
    pub channel_grace_ms: u64,
    /// Same for cached resources. Zero evicts synchronously.
    #[serde(default)]
    pub resource_grace_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_send_event")]
    pub send_event: String,
    #[serde(default = "default_fetch_event")]
    pub fetch_event: String,
    #[serde(default = "default_update_events")]
    pub update_events: Vec<String>,
    #[serde(default = "default_structural_events")]
    pub structural_events: Vec<String>,
    #[serde(default = "default_resource_key_field")]
    pub resource_key_field: String,
}

impl RegistryConfig {
    pub const ENV_PREFIX: &'static str = "REALTIME";

    /// Loads `REALTIME_*` variables, e.g. `REALTIME_CHANNEL_GRACE_MS=500` or
    /// `REALTIME_UPDATE_EVENTS=new_message,run_updated`.
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("update_events")
                    .with_list_parse_key("structural_events"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(RegistryConfig::normalize)
            .unwrap_or_else(|err| {
                warn!(target: "realtime.config", error = %err, "invalid registry configuration, using defaults");
                RegistryConfig::default()
            })
    }

    fn normalize(mut self) -> Self {
        self.send_event = Self::normalize_name(self.send_event, default_send_event);
        self.fetch_event = Self::normalize_name(self.fetch_event, default_fetch_event);
        self.resource_key_field =
            Self::normalize_name(self.resource_key_field, default_resource_key_field);
        self.update_events = Self::normalize_list(self.update_events);
        self.structural_events = Self::normalize_list(self.structural_events);
        self
    }

    fn normalize_name(value: String, fallback: fn() -> String) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            fallback()
        } else {
            trimmed.to_string()
        }
    }

    fn normalize_list(values: Vec<String>) -> Vec<String> {
        values
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    }

    pub fn channel_grace(&self) -> Duration {
        Duration::from_millis(self.channel_grace_ms)
    }

    pub fn resource_grace(&self) -> Duration {
        Duration::from_millis(self.resource_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn routing(&self) -> EventRouting {
        EventRouting {
            update_events: self.update_events.clone(),
            structural_events: self.structural_events.clone(),
            resource_key_field: self.resource_key_field.clone(),
        }
    }

    pub fn with_channel_grace(mut self, grace: Duration) -> Self {
        self.channel_grace_ms = whole_millis(grace);
        self
    }

    pub fn with_resource_grace(mut self, grace: Duration) -> Self {
        self.resource_grace_ms = whole_millis(grace);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_routing(mut self, routing: EventRouting) -> Self {
        self.update_events = routing.update_events;
        self.structural_events = routing.structural_events;
        self.resource_key_field = routing.resource_key_field;
        self
    }
}

/// Config durations have millisecond resolution. A non-zero duration never
/// rounds down to zero, since a zero grace period means tearing down at once.
fn whole_millis(duration: Duration) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let routing = EventRouting::default();
        Self {
            channel_grace_ms: default_channel_grace_ms(),
            resource_grace_ms: 0,
            request_timeout_ms: default_request_timeout_ms(),
            send_event: default_send_event(),
            fetch_event: default_fetch_event(),
            update_events: routing.update_events,
            structural_events: routing.structural_events,
            resource_key_field: routing.resource_key_field,
        }
    }
}

fn default_channel_grace_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_send_event() -> String {
    "new_message".to_string()
}

fn default_fetch_event() -> String {
    "fetch_resource".to_string()
}

fn default_update_events() -> Vec<String> {
    EventRouting::default().update_events
}

fn default_structural_events() -> Vec<String> {
    EventRouting::default().structural_events
}

fn default_resource_key_field() -> String {
    EventRouting::default().resource_key_field
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 4] = [
        "REALTIME_CHANNEL_GRACE_MS",
        "REALTIME_RESOURCE_GRACE_MS",
        "REALTIME_UPDATE_EVENTS",
        "REALTIME_SEND_EVENT",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RegistryConfig::default();
        assert_eq!(config.channel_grace(), Duration::from_secs(2));
        assert_eq!(config.resource_grace(), Duration::ZERO);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.routing(), EventRouting::default());
    }

    #[test]
    fn builder_durations_keep_millisecond_resolution() {
        let config = RegistryConfig::default()
            .with_channel_grace(Duration::from_micros(300))
            .with_resource_grace(Duration::ZERO)
            .with_request_timeout(Duration::MAX);
        assert_eq!(config.channel_grace_ms, 1);
        assert_eq!(config.resource_grace_ms, 0);
        assert_eq!(config.request_timeout_ms, u64::MAX);

        let config = config.with_channel_grace(Duration::from_micros(2_700));
        assert_eq!(config.channel_grace(), Duration::from_millis(2));
    }

    #[test]
    #[serial]
    fn empty_environment_yields_defaults() {
        clear_env();
        assert_eq!(RegistryConfig::from_env(), RegistryConfig::default());
    }

    #[test]
    #[serial]
    fn reads_overrides_from_environment() {
        clear_env();
        env::set_var("REALTIME_CHANNEL_GRACE_MS", "500");
        env::set_var("REALTIME_RESOURCE_GRACE_MS", "250");
        env::set_var("REALTIME_UPDATE_EVENTS", "run_updated, step_finished");
        env::set_var("REALTIME_SEND_EVENT", "  ");

        let config = RegistryConfig::from_env();
        clear_env();

        assert_eq!(config.channel_grace(), Duration::from_millis(500));
        assert_eq!(config.resource_grace(), Duration::from_millis(250));
        assert_eq!(config.update_events, ["run_updated", "step_finished"]);
        assert_eq!(config.send_event, "new_message");
    }

    #[test]
    #[serial]
    fn unparsable_values_fall_back_to_defaults() {
        clear_env();
        env::set_var("REALTIME_CHANNEL_GRACE_MS", "soon");

        let config = RegistryConfig::from_env();
        clear_env();

        assert_eq!(config, RegistryConfig::default());
    }
}
