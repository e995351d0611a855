//! Boundary with the browser automation framework.
//!
//! The harness never launches a browser itself. Whatever drives the page
//! implements [`PageDriver`]; [`crate::testing::FakePage`] is the in-memory
//! implementation used by the test suite.

use crate::error::HarnessError;
use crate::request::InterceptedRequest;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Network failure categories a request can be aborted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkError {
    Aborted,
    AccessDenied,
    AddressUnreachable,
    BlockedByClient,
    BlockedByResponse,
    ConnectionAborted,
    ConnectionClosed,
    ConnectionFailed,
    ConnectionRefused,
    ConnectionReset,
    InternetDisconnected,
    NameNotResolved,
    TimedOut,
    Failed,
}

impl NetworkError {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkError::Aborted => "aborted",
            NetworkError::AccessDenied => "accessdenied",
            NetworkError::AddressUnreachable => "addressunreachable",
            NetworkError::BlockedByClient => "blockedbyclient",
            NetworkError::BlockedByResponse => "blockedbyresponse",
            NetworkError::ConnectionAborted => "connectionaborted",
            NetworkError::ConnectionClosed => "connectionclosed",
            NetworkError::ConnectionFailed => "connectionfailed",
            NetworkError::ConnectionRefused => "connectionrefused",
            NetworkError::ConnectionReset => "connectionreset",
            NetworkError::InternetDisconnected => "internetdisconnected",
            NetworkError::NameNotResolved => "namenotresolved",
            NetworkError::TimedOut => "timedout",
            NetworkError::Failed => "failed",
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fulfilled mock response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl MockResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

/// What the page should do with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDisposition {
    Fulfill(MockResponse),
    Abort(NetworkError),
}

/// Handler installed for a URL pattern.
pub type RouteHandler = Arc<
    dyn Fn(InterceptedRequest) -> BoxFuture<'static, Result<RouteDisposition, HarnessError>>
        + Send
        + Sync,
>;

/// Function callable from page script under a global name.
pub type PageBinding =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Operations the harness needs from a live page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Intercept every request whose URL matches the glob `pattern`.
    async fn route(&self, pattern: &str, handler: RouteHandler) -> anyhow::Result<()>;

    /// Run `script` (a function expression) with `arg` before any page script.
    async fn add_init_script(&self, script: &str, arg: Value) -> anyhow::Result<()>;

    /// Expose `binding` to page script as `window[name]`.
    async fn expose_binding(&self, name: &str, binding: PageBinding) -> anyhow::Result<()>;

    /// Evaluate `script` (a function expression) with `arg` in the page.
    async fn evaluate(&self, script: &str, arg: Value) -> anyhow::Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_wire_names() {
        let parsed: NetworkError = serde_json::from_str("\"timedout\"").unwrap();
        assert_eq!(parsed, NetworkError::TimedOut);
        assert_eq!(
            serde_json::to_string(&NetworkError::ConnectionRefused).unwrap(),
            "\"connectionrefused\""
        );
        assert_eq!(NetworkError::NameNotResolved.to_string(), "namenotresolved");
    }
}
