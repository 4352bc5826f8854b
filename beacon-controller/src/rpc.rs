use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Remote procedures understood by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    GetSessionId,
    TouchSession,
    GetSystemInventory,
    GetAlarms,
    GetPointValues,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetSessionId => "GetSessionID",
            Method::TouchSession => "TouchSession",
            Method::GetSystemInventory => "GetSystemInventory",
            Method::GetAlarms => "GetAlarms",
            Method::GetPointValues => "GetPointValues",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request identifier cycling through `1..=999`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(u16);

impl RequestId {
    pub const MAX: u16 = 999;

    pub fn get(&self) -> u16 {
        self.0
    }

    /// Return the current id and advance the counter
    pub fn take(&mut self) -> RequestId {
        let current = *self;
        self.0 = if self.0 >= Self::MAX { 1 } else { self.0 + 1 };
        current
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId(1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A JSON-RPC 2.0 call
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    id: String,
}

impl<'a> RpcRequest<'a> {
    pub fn new(method: Method, params: Option<&'a Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.as_str(),
            params,
            id: id.to_string(),
        }
    }

    /// Build the request URL, the call travels URL-encoded in the `m`
    /// query parameter
    pub fn to_url(&self, endpoint: &str) -> serde_json::Result<String> {
        let body = serde_json::to_string(self)?;
        Ok(format!("{endpoint}?m={}", urlencoding::encode(&body)))
    }
}
