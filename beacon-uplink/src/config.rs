use std::time::Duration;

use beacon_util::http::Uri;
use beacon_util::types::SymmetricKey;

/// Global device provisioning service
pub const DEFAULT_PROVISIONING_ENDPOINT: &str = "https://global.azure-devices-provisioning.net";

/// Largest serialized envelope the hub accepts
pub const MAX_MESSAGE_SIZE: usize = 256_000;

#[derive(Clone, Debug)]
pub struct UplinkConfig {
    /// Provisioning scope the enrollment group belongs to
    pub scope_id: String,

    /// Registration id, the device key is derived from it
    pub device_id: String,

    /// Enrollment group key
    pub group_key: SymmetricKey,

    pub provisioning_endpoint: Uri,

    /// Send telemetry here instead of the assigned hub
    pub hub_endpoint: Option<Uri>,

    /// Lifetime of the hub access token
    pub sas_ttl: Duration,

    pub timeout: Duration,

    pub max_message_size: usize,
}

impl UplinkConfig {
    pub fn new(
        scope_id: impl Into<String>,
        device_id: impl Into<String>,
        group_key: SymmetricKey,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            device_id: device_id.into(),
            group_key,
            provisioning_endpoint: Uri::from_static(DEFAULT_PROVISIONING_ENDPOINT),
            hub_endpoint: None,
            sas_ttl: Duration::from_secs(90 * 24 * 60 * 60),
            timeout: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}
