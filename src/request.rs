//! Intercepted requests, route keys and the read-side view handed to matchers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Body field matchers read regardless of the backend payload shape.
pub const INSTRUCTIONS_FIELD: &str = "instructions";
/// Structured message list carried by newer payloads.
pub const MESSAGES_FIELD: &str = "messages";

/// HTTP methods the harness can mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported method: {}", other)),
        }
    }
}

/// A request captured by the page driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub body: Option<String>,
}

impl InterceptedRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_json(self, body: &Value) -> Self {
        self.with_body(body.to_string())
    }
}

/// Strip query string and fragment, keeping `{origin}{path}`.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) if url.has_host() => {
            format!("{}{}", url.origin().ascii_serialization(), url.path())
        }
        _ => {
            let end = raw.find(['?', '#']).unwrap_or(raw.len());
            raw[..end].to_string()
        }
    }
}

/// Route key used to bucket mock records.
pub fn route_key(method: HttpMethod, url: &str) -> String {
    format!("{} {}", method, normalize_url(url))
}

/// Read-only adapter over an intercepted request.
///
/// `json()` exposes the legacy `instructions` field synthesized from the
/// message list when the body only carries `messages`.
#[derive(Debug, Clone)]
pub struct RequestView {
    request: Arc<InterceptedRequest>,
    route_key: String,
    raw_json: Option<Value>,
    json: Option<Value>,
    query: HashMap<String, String>,
}

impl RequestView {
    pub fn new(request: InterceptedRequest) -> Self {
        let route_key = route_key(request.method, &request.url);
        let raw_json = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str::<Value>(b).ok());
        let json = raw_json.as_ref().map(with_legacy_instructions);
        let query = Url::parse(&request.url)
            .map(|u| u.query_pairs().into_owned().collect())
            .unwrap_or_default();

        Self {
            request: Arc::new(request),
            route_key,
            raw_json,
            json,
            query,
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.request.method
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    /// Path portion of the URL, without query string.
    pub fn path(&self) -> String {
        Url::parse(&self.request.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| normalize_url(&self.request.url))
    }

    pub fn body(&self) -> Option<&str> {
        self.request.body.as_deref()
    }

    /// The body exactly as sent, parsed as JSON.
    pub fn raw_json(&self) -> Option<&Value> {
        self.raw_json.as_ref()
    }

    /// The body as matchers see it.
    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.json
            .as_ref()
            .and_then(|j| j.get(INSTRUCTIONS_FIELD))
            .and_then(Value::as_str)
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn request(&self) -> &InterceptedRequest {
        &self.request
    }
}

fn with_legacy_instructions(raw: &Value) -> Value {
    let Some(obj) = raw.as_object() else {
        return raw.clone();
    };
    if obj.contains_key(INSTRUCTIONS_FIELD) {
        return raw.clone();
    }
    let Some(messages) = obj.get(MESSAGES_FIELD).and_then(Value::as_array) else {
        return raw.clone();
    };

    let joined = messages
        .iter()
        .filter_map(|m| m.get("content").map(message_text))
        .collect::<Vec<_>>()
        .join("\n");

    let mut view = obj.clone();
    view.insert(INSTRUCTIONS_FIELD.to_string(), Value::String(joined));
    Value::Object(view)
}

/// Text of a message `content`, which is a string or a list of parts.
fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
