//! Cloud uplink.
//!
//! The device is registered with the provisioning service using a key
//! derived from the enrollment group key, then telemetry is posted to the
//! assigned hub in envelopes no larger than the hub message limit.

mod client;
mod config;
pub mod envelope;
pub mod transport;

pub use client::{DeviceIdentity, SendReport, UplinkClient, UplinkError};
pub use config::{DEFAULT_PROVISIONING_ENDPOINT, MAX_MESSAGE_SIZE, UplinkConfig};
pub use transport::{Assignment, HttpTransport, Link, Transport, TransportError};

pub use beacon_util::types::SymmetricKey;
