use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, warn};

use beacon_queue::QueuedRecord;
use beacon_util::crypto::{KeyError, derive_device_key};
use beacon_util::types::SymmetricKey;

use crate::config::UplinkConfig;
use crate::envelope::{self, Batch};
use crate::transport::{HttpTransport, Link, Transport, TransportError};

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("uplink is not connected")]
    NotConnected,

    #[error("failed to derive device key: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode message: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Identity obtained from provisioning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub scope_id: String,
    pub device_id: String,
    pub hub: String,
    pub key: SymmetricKey,
}

/// Result of a successful send
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    pub envelopes: usize,
    pub records: usize,

    /// Records too large to be sent
    pub dropped: Vec<i64>,
}

struct Connection {
    identity: DeviceIdentity,
    link: Arc<dyn Link>,
}

/// Cloud uplink for telemetry
///
/// Holds at most one open link. Any failure on the link closes it and
/// flips the connection state, the next [`UplinkClient::provision`] starts
/// over from registration.
pub struct UplinkClient {
    config: UplinkConfig,
    transport: Box<dyn Transport>,
    connection: Mutex<Option<Connection>>,
    state: watch::Sender<bool>,
}

impl UplinkClient {
    pub fn new(config: UplinkConfig, transport: impl Transport + 'static) -> Self {
        Self {
            config,
            transport: Box::new(transport),
            connection: Mutex::new(None),
            state: watch::Sender::new(false),
        }
    }

    /// Uplink over the HTTPS endpoints named in the config
    pub fn with_http(config: UplinkConfig) -> Self {
        let transport = HttpTransport::new(&config);
        Self::new(config, transport)
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Follow connection state changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub async fn identity(&self) -> Option<DeviceIdentity> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.identity.clone())
    }

    /// Register the device and open a link to its hub
    ///
    /// On failure the client is left disconnected with no identity.
    #[instrument(skip_all, fields(device_id = %self.config.device_id), err)]
    pub async fn provision(&self) -> Result<(), UplinkError> {
        let mut connection = self.connection.lock().await;
        if let Some(previous) = connection.take() {
            close(previous.link).await;
        }
        self.state.send_replace(false);

        let key = derive_device_key(&self.config.group_key, &self.config.device_id)?;
        let assignment = self
            .transport
            .register(&self.config.device_id, &key)
            .await?;
        info!(hub = %assignment.hub, "provisioned device {}", assignment.device_id);

        let link = self.transport.connect(&assignment, &key).await?;
        *connection = Some(Connection {
            identity: DeviceIdentity {
                scope_id: self.config.scope_id.clone(),
                device_id: assignment.device_id,
                hub: assignment.hub,
                key,
            },
            link,
        });
        self.state.send_replace(true);
        info!("device is ready to send telemetry");
        Ok(())
    }

    /// Send records in size-bounded envelopes
    ///
    /// Envelopes are sent concurrently, the call succeeds only if all of
    /// them were accepted. Any failure disconnects the client.
    #[instrument(skip_all, fields(records = records.len()), err)]
    pub async fn send(&self, records: &[QueuedRecord]) -> Result<SendReport, UplinkError> {
        let link = match self.connection.lock().await.as_ref() {
            Some(connection) if self.is_connected() => Arc::clone(&connection.link),
            _ => {
                warn!("cannot send telemetry, device is not connected");
                return Err(UplinkError::NotConnected);
            }
        };

        let Batch { envelopes, dropped } =
            envelope::batch(records, Utc::now(), self.config.max_message_size)?;
        debug!(envelopes = envelopes.len(), "sending telemetry");

        let results = join_all(envelopes.iter().map(|e| link.send(e))).await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            error!("uplink was connected but the send failed: {err}");
            self.drop_connection().await;
            return Err(err.into());
        }

        Ok(SendReport {
            envelopes: envelopes.len(),
            records: envelopes.iter().map(|e| e.records().len()).sum(),
            dropped,
        })
    }

    /// Close the link if one is open
    pub async fn disconnect(&self) {
        if self.drop_connection().await {
            info!("disconnected from hub");
        } else {
            debug!("uplink was not connected");
        }
    }

    async fn drop_connection(&self) -> bool {
        let connection = self.connection.lock().await.take();
        self.state.send_replace(false);
        match connection {
            Some(connection) => {
                close(connection.link).await;
                true
            }
            None => false,
        }
    }
}

async fn close(link: Arc<dyn Link>) {
    if let Err(e) = link.close().await {
        warn!("failed to close link: {e}");
    }
}
