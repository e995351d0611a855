//! Mock registry: ordered response templates per route key.

use crate::driver::NetworkError;
use crate::matcher::MockMatcher;
use crate::request::{HttpMethod, RequestView};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type ComputeFn = dyn Fn(RequestView) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Payload of a mock, resolved at response time.
#[derive(Clone)]
pub enum MockValue {
    /// Returned verbatim
    Static(Value),
    /// String fields rendered as templates against the request
    Template(Value),
    /// Computed per request
    Computed(Arc<ComputeFn>),
}

impl fmt::Debug for MockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockValue::Static(v) => f.debug_tuple("Static").field(v).finish(),
            MockValue::Template(v) => f.debug_tuple("Template").field(v).finish(),
            MockValue::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl MockValue {
    /// Value computed by a synchronous function of the request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&RequestView) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        MockValue::Computed(Arc::new(move |req| {
            let result = f(&req);
            async move { result }.boxed()
        }))
    }

    /// Value computed by an async function of the request.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestView) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        MockValue::Computed(Arc::new(move |req| f(req).boxed()))
    }
}

impl From<Value> for MockValue {
    fn from(value: Value) -> Self {
        MockValue::Static(value)
    }
}

/// Per-record behavior overrides.
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Abort with this category instead of fulfilling
    pub error: Option<NetworkError>,
    /// Milliseconds to wait before resolving
    pub delay_ms: u64,
    /// Absent marks the record as a fallback
    pub matcher: Option<MockMatcher>,
    /// Overrides the namespace's default method
    pub method: Option<HttpMethod>,
    /// Remove the record after it is selected once
    pub once: bool,
}

impl MockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, error: NetworkError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn matcher(mut self, matcher: MockMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Shorthand for `matcher(MockMatcher::new(f))`.
    pub fn matching<F>(self, f: F) -> Self
    where
        F: Fn(&RequestView) -> bool + Send + Sync + 'static,
    {
        self.matcher(MockMatcher::new(f))
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// One registered response definition.
#[derive(Debug, Clone)]
pub struct MockRecord {
    pub value: MockValue,
    pub method: HttpMethod,
    pub options: MockOptions,
    pub is_streaming: bool,
    /// Name used in logs
    pub label: Option<String>,
    /// Assigned by the registry on insertion
    id: u64,
}

impl MockRecord {
    pub fn new(method: HttpMethod, value: impl Into<MockValue>) -> Self {
        Self {
            value: value.into(),
            method,
            options: MockOptions::default(),
            is_streaming: false,
            label: None,
            id: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn with_options(mut self, options: MockOptions) -> Self {
        if let Some(method) = options.method {
            self.method = method;
        }
        self.options = options;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_fallback(&self) -> bool {
        self.options.matcher.is_none()
    }
}

/// Ordered buckets of records keyed by route key.
///
/// Buckets are created on first registration and never removed; one-shot
/// consumption only removes records from them.
#[derive(Debug, Default)]
pub struct MockRegistry {
    buckets: HashMap<String, Vec<MockRecord>>,
    next_id: u64,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `record` to the bucket for `route_key`. Returns the record id.
    pub fn register(&mut self, route_key: impl Into<String>, mut record: MockRecord) -> u64 {
        self.next_id += 1;
        record.id = self.next_id;
        self.buckets.entry(route_key.into()).or_default().push(record);
        self.next_id
    }

    pub fn bucket(&self, route_key: &str) -> Option<&[MockRecord]> {
        self.buckets.get(route_key).map(Vec::as_slice)
    }

    pub fn bucket_len(&self, route_key: &str) -> usize {
        self.buckets.get(route_key).map_or(0, Vec::len)
    }

    /// Remove and return the record with `id` from a bucket.
    pub fn take(&mut self, route_key: &str, id: u64) -> Option<MockRecord> {
        let bucket = self.buckets.get_mut(route_key)?;
        let index = bucket.iter().position(|r| r.id == id)?;
        Some(bucket.remove(index))
    }

    pub fn route_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.buckets.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn total_records(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_preserves_order() {
        let mut registry = MockRegistry::new();
        registry.register("GET https://a.test/x", MockRecord::new(HttpMethod::Get, json!(1)));
        registry.register("GET https://a.test/x", MockRecord::new(HttpMethod::Get, json!(2)));

        let bucket = registry.bucket("GET https://a.test/x").unwrap();
        assert_eq!(bucket.len(), 2);
        assert!(matches!(&bucket[0].value, MockValue::Static(v) if *v == json!(1)));
        assert!(matches!(&bucket[1].value, MockValue::Static(v) if *v == json!(2)));
    }

    #[test]
    fn test_take_keeps_empty_bucket() {
        let mut registry = MockRegistry::new();
        let id = registry.register("GET https://a.test/x", MockRecord::new(HttpMethod::Get, json!(1)));
        assert!(registry.take("GET https://a.test/x", id).is_some());
        assert!(registry.take("GET https://a.test/x", id).is_none());
        assert_eq!(registry.bucket_len("GET https://a.test/x"), 0);
        assert_eq!(registry.route_keys(), vec!["GET https://a.test/x"]);
    }

    #[test]
    fn test_options_method_override() {
        let record = MockRecord::new(HttpMethod::Get, json!(null))
            .with_options(MockOptions::new().method(HttpMethod::Put));
        assert_eq!(record.method, HttpMethod::Put);
        assert!(record.is_fallback());
    }

    #[test]
    fn test_matcher_marks_non_fallback() {
        let record = MockRecord::new(HttpMethod::Get, json!(null))
            .with_options(MockOptions::new().matching(|_| true).once());
        assert!(!record.is_fallback());
        assert!(record.options.once);
    }
}
