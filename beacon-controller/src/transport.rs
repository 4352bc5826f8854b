use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{Span, debug, error, field, instrument, warn};

use crate::config::HttpPolicy;
use crate::rpc::Method;

/// Marker carried by every synthetic failure record
pub const REQUEST_FAILED: &str = "Could not complete request";

/// Verb used for a call, the controller reads the call from the query
/// either way
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

impl From<Verb> for reqwest::Method {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Get => reqwest::Method::GET,
            Verb::Post => reqwest::Method::POST,
        }
    }
}

#[derive(Debug, Error)]
enum TryRequestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("controller responded with {0}")]
    Status(StatusCode),

    /// The controller answered but not with a result
    #[error("response carries no result")]
    NoResult,
}

/// Rate-limited HTTP client for a single controller
#[derive(Clone, Debug)]
pub struct Transport {
    client: reqwest::Client,
    address: String,
    policy: HttpPolicy,
}

impl Transport {
    pub fn new(address: impl Into<String>, policy: HttpPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.into(),
            policy,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn policy(&self) -> &HttpPolicy {
        &self.policy
    }

    /// Endpoint all calls are sent to
    pub fn endpoint(&self) -> String {
        format!("http://{}/cgi-bin/mgw.cgi", self.address)
    }

    /// Send every URL in order, pausing between requests
    ///
    /// Never fails, a request that could not be completed yields a
    /// synthetic failure record in its place.
    pub async fn execute(&self, verb: Verb, method: Method, urls: Vec<String>) -> Vec<Value> {
        let mut responses = Vec::with_capacity(urls.len());
        for url in urls {
            responses.push(self.request(verb, method, &url).await);
            tokio::time::sleep(self.policy.request_delay).await;
        }
        responses
    }

    #[instrument(skip_all, fields(address = %self.address, %method, tries = field::Empty))]
    async fn request(&self, verb: Verb, method: Method, url: &str) -> Value {
        debug!("sending {method}");
        let attempts = self.policy.retries.max(1);
        for tries in 1..=attempts {
            Span::current().record("tries", tries);
            match self.try_request(verb, url).await {
                Ok(response) => return response,
                // the controller answered, asking again will not help
                Err(TryRequestError::NoResult) => break,
                Err(e) => {
                    warn!("{e}");
                    if tries < attempts {
                        debug!("will retry in {:?}", self.policy.retry_delay);
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        error!("{REQUEST_FAILED}");
        failure(method, &self.address)
    }

    async fn try_request(&self, verb: Verb, url: &str) -> Result<Value, TryRequestError> {
        let response = self
            .client
            .request(verb.into(), url)
            .timeout(self.policy.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TryRequestError::Status(status));
        }

        let mut value: Value = response.json().await?;
        match value.get_mut("result").and_then(Value::as_object_mut) {
            Some(result) => {
                result.insert("ip".into(), Value::String(self.address.clone()));
                Ok(value)
            }
            None => Err(TryRequestError::NoResult),
        }
    }
}

/// Build the record returned in place of a response that never arrived
pub fn failure(method: Method, address: &str) -> Value {
    json!({ "method": method.as_str(), "ip": address, "error": REQUEST_FAILED })
}

/// Whether a response is a synthetic failure record
pub fn is_failure(response: &Value) -> bool {
    response.get("error").and_then(Value::as_str) == Some(REQUEST_FAILED)
}
