use std::time::Duration;

use serde::{Deserialize, Serialize};

use beacon_util::config::StoredConfig;
use beacon_util::json::{deserialize_interval_from_ms, serialize_duration_to_ms};

/// A controller reachable on the local network
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Device {
    pub name: String,

    /// Host (and optional port) of the controller web endpoint
    pub address: String,
}

/// The `controllers` configuration document
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ControllersConfig {
    /// Time between point polling rounds
    #[serde(
        rename = "poll_interval_ms",
        deserialize_with = "deserialize_interval_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub poll_interval: Duration,

    pub devices: Vec<Device>,
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(180),
            devices: vec![Device {
                name: "panel_0".into(),
                address: "192.168.1.250".into(),
            }],
        }
    }
}

impl StoredConfig for ControllersConfig {
    fn kind() -> &'static str {
        "controllers"
    }
}

/// How requests to a controller are paced and retried
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpPolicy {
    /// Attempts per request before giving up
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    /// Pause between consecutive requests of one batch
    pub request_delay: Duration,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(3_000),
            timeout: Duration::from_secs(3),
            request_delay: Duration::from_millis(1_000),
        }
    }
}
