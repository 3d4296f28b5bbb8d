use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub ack_flush_interval_ms: u64,
    pub max_acks_per_message: usize,
    pub ping_interval_ms: u64,
    pub logout_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub queue_wait_ms: u64,
    pub transmit_queue_capacity: usize,
    pub worker_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub duplicate_window: usize,
    pub image_first_chunk: usize,
    pub image_chunk: usize,
    pub transfer_chunk: usize,
    pub kill_batch_size: usize,
    pub long_poll_attempts: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            ack_flush_interval_ms: 1_000,
            max_acks_per_message: 100,
            ping_interval_ms: 5_000,
            logout_timeout_ms: 10_000,
            inactivity_timeout_ms: 60_000,
            queue_wait_ms: 1_000,
            transmit_queue_capacity: 1024,
            worker_queue_capacity: 256,
            event_queue_capacity: 64,
            duplicate_window: 256,
            image_first_chunk: 600,
            image_chunk: 1000,
            transfer_chunk: 1000,
            kill_batch_size: 250,
            long_poll_attempts: 30,
        }
    }
}

impl CircuitConfig {
    pub fn ack_flush_interval(&self) -> Duration {
        Duration::from_millis(self.ack_flush_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_millis(self.logout_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}

/// How a capability requested through the seed is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilitySetting {
    Localhost,
    Template(String),
}

impl From<String> for CapabilitySetting {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("localhost") {
            Self::Localhost
        } else {
            Self::Template(value)
        }
    }
}

impl From<CapabilitySetting> for String {
    fn from(value: CapabilitySetting) -> Self {
        match value {
            CapabilitySetting::Localhost => "localhost".to_string(),
            CapabilitySetting::Template(template) => template,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsConfig {
    /// Public base URL of the capability HTTP server, without trailing slash.
    pub http_base: String,
    pub capabilities: HashMap<String, CapabilitySetting>,
    /// Uploader endpoints a circuit may hold before the oldest is retired.
    pub max_pending_uploads: usize,
}

impl Default for CapsConfig {
    fn default() -> Self {
        let capabilities = [
            "EventQueueGet",
            "GetMesh",
            "UploadBakedTexture",
        ]
        .into_iter()
        .map(|name| (name.to_string(), CapabilitySetting::Localhost))
        .collect();

        Self {
            http_base: format!("http://127.0.0.1:{}", crate::net::DEFAULT_HTTP_PORT),
            capabilities,
            max_pending_uploads: 4,
        }
    }
}

impl CapsConfig {
    pub fn capability_url(&self, id: &uuid::Uuid) -> String {
        format!("{}/CAPS/{}", self.http_base.trim_end_matches('/'), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_setting_from_string() {
        assert_eq!(
            CapabilitySetting::from("LocalHost".to_string()),
            CapabilitySetting::Localhost
        );
        assert_eq!(
            CapabilitySetting::from("http://x/%u".to_string()),
            CapabilitySetting::Template("http://x/%u".to_string())
        );
    }

    #[test]
    fn test_caps_config_deserializes() {
        let json = r#"{
            "http_base": "http://sim.example:9001/",
            "capabilities": { "GetMesh": "localhost", "FetchInventory2": "http://inv/%u" }
        }"#;
        let config: CapsConfig = serde_json::from_str(json).unwrap();

        assert_eq!(
            config.capabilities["FetchInventory2"],
            CapabilitySetting::Template("http://inv/%u".to_string())
        );
        let id = uuid::Uuid::nil();
        assert_eq!(
            config.capability_url(&id),
            format!("http://sim.example:9001/CAPS/{id}")
        );
    }
}
