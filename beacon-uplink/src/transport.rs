use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{Span, debug, field, instrument};

use beacon_util::crypto::{KeyError, sas_token};
use beacon_util::http::{InvalidUriError, Uri};
use beacon_util::types::SymmetricKey;

use crate::config::UplinkConfig;
use crate::envelope::Envelope;

const PROVISIONING_API_VERSION: &str = "2021-06-01";
const HUB_API_VERSION: &str = "2020-03-13";

/// Hub tokens are renewed this long before they expire
const TOKEN_RENEWAL_MARGIN: TimeDelta = TimeDelta::minutes(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint URI: {0}")]
    InvalidUri(#[from] InvalidUriError),

    #[error("failed to sign request: {0}")]
    Key(#[from] KeyError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("remote returned error: ({0}) {1}")]
    Status(StatusCode, String),

    #[error("registration ended with status {0}")]
    Registration(String),

    #[error("registration was not assigned after {0} attempts")]
    NotAssigned(u32),
}

/// Hub and device id assigned by the provisioning service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub hub: String,
    pub device_id: String,
}

/// Registers devices and opens links to their hub
#[async_trait]
pub trait Transport: Send + Sync {
    async fn register(
        &self,
        registration_id: &str,
        key: &SymmetricKey,
    ) -> Result<Assignment, TransportError>;

    async fn connect(
        &self,
        assignment: &Assignment,
        key: &SymmetricKey,
    ) -> Result<Arc<dyn Link>, TransportError>;
}

/// An open channel to the hub
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport over the HTTPS APIs of the provisioning service and the hub
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    scope_id: String,
    provisioning_endpoint: Uri,
    hub_endpoint: Option<Uri>,
    sas_ttl: Duration,
    timeout: Duration,
    poll_delay: Duration,
    max_polls: u32,
}

impl HttpTransport {
    pub fn new(config: &UplinkConfig) -> Self {
        Self {
            client: Client::new(),
            scope_id: config.scope_id.clone(),
            provisioning_endpoint: config.provisioning_endpoint.clone(),
            hub_endpoint: config.hub_endpoint.clone(),
            sas_ttl: config.sas_ttl,
            timeout: config.timeout,
            poll_delay: Duration::from_secs(3),
            max_polls: 10,
        }
    }

    /// Wait at most `max_polls` times for the registration to be assigned
    pub fn with_polling(mut self, poll_delay: Duration, max_polls: u32) -> Self {
        self.poll_delay = poll_delay;
        self.max_polls = max_polls;
        self
    }

    fn registration_uri(&self, registration_id: &str, path: &str) -> Result<String, TransportError> {
        let uri = Uri::from_parts(
            self.provisioning_endpoint.clone(),
            &format!("/{}/registrations/{registration_id}{path}", self.scope_id),
            Some(&format!("api-version={PROVISIONING_API_VERSION}")),
        )?;
        Ok(uri.to_string())
    }

    fn retry_after(&self, response: &reqwest::Response) -> Duration {
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.poll_delay)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    operation_id: Option<String>,
    status: String,
    registration_state: Option<RegistrationState>,
}

enum Progress {
    Assigned(Assignment),
    Pending(String, Duration),
}

impl HttpTransport {
    async fn read_operation(
        &self,
        response: reqwest::Response,
        operation_id: Option<&str>,
    ) -> Result<Progress, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let msg = response.text().await.unwrap_or_default();
            return Err(TransportError::Status(status, msg));
        }

        let wait = self.retry_after(&response);
        let operation: RegistrationOperation = response.json().await?;
        match operation.status.as_str() {
            "assigned" => {
                let state = operation
                    .registration_state
                    .ok_or_else(|| TransportError::Registration(operation.status.clone()))?;
                match (state.assigned_hub, state.device_id) {
                    (Some(hub), Some(device_id)) => Ok(Progress::Assigned(Assignment { hub, device_id })),
                    _ => Err(TransportError::Registration(operation.status)),
                }
            }
            "assigning" | "unassigned" => {
                let id = operation
                    .operation_id
                    .or_else(|| operation_id.map(String::from))
                    .ok_or_else(|| TransportError::Registration(operation.status))?;
                Ok(Progress::Pending(id, wait))
            }
            _ => Err(TransportError::Registration(operation.status)),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(registration_id = %registration_id, attempts = field::Empty), err)]
    async fn register(
        &self,
        registration_id: &str,
        key: &SymmetricKey,
    ) -> Result<Assignment, TransportError> {
        let resource = format!("{}/registrations/{registration_id}", self.scope_id);
        let token = sas_token(&resource, key, Utc::now() + TimeDelta::hours(1), Some("registration"))?;

        debug!("registering with provisioning service");
        let response = self
            .client
            .put(self.registration_uri(registration_id, "/register")?)
            .header("authorization", &token)
            .timeout(self.timeout)
            .json(&json!({ "registrationId": registration_id }))
            .send()
            .await?;

        let mut progress = self.read_operation(response, None).await?;
        let mut attempts = 0;
        loop {
            Span::current().record("attempts", attempts);
            let (operation_id, wait) = match progress {
                Progress::Assigned(assignment) => return Ok(assignment),
                Progress::Pending(_, _) if attempts >= self.max_polls => {
                    return Err(TransportError::NotAssigned(attempts));
                }
                Progress::Pending(id, wait) => (id, wait),
            };

            tokio::time::sleep(wait).await;
            attempts += 1;

            let response = self
                .client
                .get(self.registration_uri(registration_id, &format!("/operations/{operation_id}"))?)
                .header("authorization", &token)
                .timeout(self.timeout)
                .send()
                .await?;
            progress = self.read_operation(response, Some(&operation_id)).await?;
        }
    }

    async fn connect(
        &self,
        assignment: &Assignment,
        key: &SymmetricKey,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let base = match &self.hub_endpoint {
            Some(uri) => uri.clone(),
            None => Uri::from_host("https", &assignment.hub)?,
        };
        let events = Uri::from_parts(
            base,
            &format!("/devices/{}/messages/events", assignment.device_id),
            Some(&format!("api-version={HUB_API_VERSION}")),
        )?;

        let link = HttpLink {
            client: self.client.clone(),
            events: events.to_string(),
            resource: format!("{}/devices/{}", assignment.hub, assignment.device_id),
            key: key.clone(),
            sas_ttl: self.sas_ttl,
            timeout: self.timeout,
            token: Mutex::new(None),
        };
        // fail early on a key that cannot sign
        link.token().await?;

        Ok(Arc::new(link))
    }
}

#[derive(Debug)]
struct Token {
    value: String,
    expires: DateTime<Utc>,
}

/// Link posting each envelope as a device-to-cloud message
#[derive(Debug)]
struct HttpLink {
    client: Client,
    events: String,
    resource: String,
    key: SymmetricKey,
    sas_ttl: Duration,
    timeout: Duration,
    token: Mutex<Option<Token>>,
}

impl HttpLink {
    /// Current access token, renewed shortly before it expires
    async fn token(&self) -> Result<String, TransportError> {
        let mut token = self.token.lock().await;
        let now = Utc::now();
        if let Some(current) = token
            .as_ref()
            .filter(|t| t.expires - TOKEN_RENEWAL_MARGIN > now)
        {
            return Ok(current.value.clone());
        }

        let ttl = TimeDelta::from_std(self.sas_ttl).unwrap_or(TimeDelta::days(90));
        let expires = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let value = sas_token(&self.resource, &self.key, expires, None)?;
        *token = Some(Token {
            value: value.clone(),
            expires,
        });
        Ok(value)
    }
}

#[async_trait]
impl Link for HttpLink {
    #[instrument(skip_all, fields(size = envelope.size(), status = field::Empty), err)]
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let token = self.token().await?;
        let response = self
            .client
            .post(&self.events)
            .header("authorization", token)
            .header("iothub-messageid", uuid::Uuid::new_v4().to_string())
            .header("content-type", "application/json")
            .header("content-encoding", "utf-8")
            .timeout(self.timeout)
            .body(envelope.body().to_owned())
            .send()
            .await?;

        let status = response.status();
        Span::current().record("status", status.as_u16());
        if !status.is_success() {
            let msg = response.text().await.unwrap_or_default();
            return Err(TransportError::Status(status, msg));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.token.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};

    use beacon_queue::QueuedRecord;

    use super::*;
    use crate::envelope::batch;

    const DEVICE_KEY: &str = "jLyV5BMPwYbLnZ3iE3wtefAKDA2fh5/vi3v+hzEViHA=";

    fn transport(server: &Server) -> HttpTransport {
        let mut config = UplinkConfig::new("0ne00000000", "gateway-01", "unused".into());
        config.provisioning_endpoint = server.url().parse().unwrap();
        config.hub_endpoint = Some(server.url().parse().unwrap());
        HttpTransport::new(&config).with_polling(Duration::from_millis(1), 3)
    }

    fn envelope() -> Envelope {
        let record = QueuedRecord {
            id: 1,
            timestamp: Utc::now(),
            address: "10.0.0.5".into(),
            response: r#"{"result":{}}"#.into(),
            method: "GetAlarms".into(),
        };
        batch(&[record], Utc::now(), 256_000)
            .unwrap()
            .envelopes
            .remove(0)
    }

    #[tokio::test]
    async fn it_registers_and_polls_until_assigned() {
        let mut server = Server::new_async().await;
        let register = server
            .mock("PUT", "/0ne00000000/registrations/gateway-01/register")
            .match_query(Matcher::UrlEncoded("api-version".into(), "2021-06-01".into()))
            .match_header("authorization", Matcher::Regex("^SharedAccessSignature sr=0ne00000000%2Fregistrations%2Fgateway-01&sig=.+&skn=registration$".into()))
            .match_body(Matcher::Json(json!({ "registrationId": "gateway-01" })))
            .with_status(202)
            .with_body(r#"{"operationId":"op-1","status":"assigning"}"#)
            .create_async()
            .await;
        let operation = server
            .mock("GET", "/0ne00000000/registrations/gateway-01/operations/op-1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"operationId":"op-1","status":"assigned","registrationState":{"assignedHub":"hub-1.example.net","deviceId":"gateway-01"}}"#,
            )
            .create_async()
            .await;

        let assignment = transport(&server)
            .register("gateway-01", &DEVICE_KEY.into())
            .await
            .unwrap();

        assert_eq!(
            assignment,
            Assignment {
                hub: "hub-1.example.net".into(),
                device_id: "gateway-01".into()
            }
        );
        register.assert_async().await;
        operation.assert_async().await;
    }

    #[tokio::test]
    async fn it_gives_up_on_registrations_that_stay_pending() {
        let mut server = Server::new_async().await;
        server
            .mock("PUT", "/0ne00000000/registrations/gateway-01/register")
            .match_query(Matcher::Any)
            .with_status(202)
            .with_body(r#"{"operationId":"op-1","status":"assigning"}"#)
            .create_async()
            .await;
        let operation = server
            .mock("GET", "/0ne00000000/registrations/gateway-01/operations/op-1")
            .match_query(Matcher::Any)
            .with_status(202)
            .with_body(r#"{"operationId":"op-1","status":"assigning"}"#)
            .expect(3)
            .create_async()
            .await;

        let res = transport(&server)
            .register("gateway-01", &DEVICE_KEY.into())
            .await;

        assert!(matches!(res, Err(TransportError::NotAssigned(3))));
        operation.assert_async().await;
    }

    #[tokio::test]
    async fn it_reports_rejected_registrations() {
        let mut server = Server::new_async().await;
        server
            .mock("PUT", "/0ne00000000/registrations/gateway-01/register")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let res = transport(&server)
            .register("gateway-01", &DEVICE_KEY.into())
            .await;

        assert!(matches!(res, Err(TransportError::Status(StatusCode::UNAUTHORIZED, _))));
    }

    #[tokio::test]
    async fn it_posts_envelopes_to_the_device_events() {
        let mut server = Server::new_async().await;
        let envelope = envelope();
        let events = server
            .mock("POST", "/devices/gateway-01/messages/events")
            .match_query(Matcher::UrlEncoded("api-version".into(), "2020-03-13".into()))
            .match_header("authorization", Matcher::Regex("^SharedAccessSignature sr=hub-1.example.net%2Fdevices%2Fgateway-01&sig=.+&se=[0-9]+$".into()))
            .match_header("iothub-messageid", Matcher::Any)
            .match_body(envelope.body())
            .with_status(204)
            .create_async()
            .await;

        let assignment = Assignment {
            hub: "hub-1.example.net".into(),
            device_id: "gateway-01".into(),
        };
        let link = transport(&server)
            .connect(&assignment, &DEVICE_KEY.into())
            .await
            .unwrap();
        link.send(&envelope).await.unwrap();

        events.assert_async().await;
    }

    #[tokio::test]
    async fn it_fails_sends_the_hub_rejects() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/devices/gateway-01/messages/events")
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let assignment = Assignment {
            hub: "hub-1.example.net".into(),
            device_id: "gateway-01".into(),
        };
        let link = transport(&server)
            .connect(&assignment, &DEVICE_KEY.into())
            .await
            .unwrap();

        let res = link.send(&envelope()).await;
        assert!(matches!(res, Err(TransportError::Status(StatusCode::TOO_MANY_REQUESTS, _))));
    }

    fn link(sas_ttl: Duration) -> HttpLink {
        HttpLink {
            client: Client::new(),
            events: "http://127.0.0.1/devices/gateway-01/messages/events".into(),
            resource: "hub-1.example.net/devices/gateway-01".into(),
            key: DEVICE_KEY.into(),
            sas_ttl,
            timeout: Duration::from_secs(1),
            token: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn it_reuses_tokens_until_close_to_expiry() {
        let link = link(Duration::from_secs(24 * 60 * 60));
        let first = link.token().await.unwrap();
        assert_eq!(link.token().await.unwrap(), first);

        // a send started now could outlive this token
        let closing = Utc::now() + TimeDelta::minutes(2);
        link.token.lock().await.as_mut().unwrap().expires = closing;
        link.token().await.unwrap();

        let renewed = link.token.lock().await.as_ref().unwrap().expires;
        assert!(renewed > Utc::now() + TimeDelta::hours(23));
    }

    #[tokio::test]
    async fn it_refuses_to_connect_with_an_invalid_key() {
        let server = Server::new_async().await;
        let assignment = Assignment {
            hub: "hub-1.example.net".into(),
            device_id: "gateway-01".into(),
        };

        let res = transport(&server)
            .connect(&assignment, &"not base64!".into())
            .await;

        assert!(matches!(res, Err(TransportError::Key(_))));
    }
}
