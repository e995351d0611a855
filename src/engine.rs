//! Mock resolution engine.
//!
//! Every intercepted request is keyed, matched against its bucket and
//! answered from the winning record, or aborted.

use crate::config::{GlobalSettings, MockDefinition, Origins};
use crate::driver::{MockResponse, NetworkError, RouteDisposition};
use crate::error::{HarnessError, Result};
use crate::matcher::MockMatcher;
use crate::registry::{MockOptions, MockRecord, MockRegistry, MockValue};
use crate::request::{route_key, InterceptedRequest, RequestView};
use crate::stream::{format_event_stream, EVENT_STREAM_CONTENT_TYPE};
use crate::template::TemplateEngine;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub records: usize,
}

/// Resolves intercepted requests against the mock registry.
pub struct MockResolutionEngine {
    registry: Mutex<MockRegistry>,
    template_engine: TemplateEngine,
    settings: GlobalSettings,
    /// Total requests resolved.
    requests_total: AtomicU64,
    /// Requests answered by a mock.
    requests_matched: AtomicU64,
    /// Requests with no bucket or no winner.
    requests_unmatched: AtomicU64,
}

impl MockResolutionEngine {
    pub fn new(settings: GlobalSettings) -> Self {
        Self {
            registry: Mutex::new(MockRegistry::new()),
            template_engine: TemplateEngine::new(),
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Append `record` to the bucket for `route_key`.
    pub fn register(&self, route_key: impl Into<String>, record: MockRecord) -> u64 {
        let route_key = route_key.into();
        debug!(route_key = %route_key, label = ?record.label, "Registering mock");
        self.registry.lock().register(route_key, record)
    }

    /// Register a mock declared in the configuration file.
    pub fn register_definition(&self, origins: &Origins, def: &MockDefinition) -> Result<String> {
        let url = origins.url(def.origin, &def.path);
        let key = route_key(def.method, &url);

        let value = if def.template {
            MockValue::Template(def.response.clone())
        } else {
            MockValue::Static(def.response.clone())
        };

        let mut options = MockOptions::new().delay_ms(def.delay_ms);
        if !def.matcher.is_empty() {
            let matcher = MockMatcher::from_predicates(&def.matcher)
                .map_err(|e| HarnessError::Config(e.to_string()))?;
            options = options.matcher(matcher);
        }
        if let Some(error) = def.error {
            options = options.error(error);
        }
        if def.once {
            options = options.once();
        }

        let mut record = MockRecord::new(def.method, value).with_options(options);
        if def.streaming {
            record = record.streaming();
        }
        if let Some(id) = &def.id {
            record = record.labeled(id.clone());
        }

        self.register(key.clone(), record);
        Ok(key)
    }

    pub fn bucket_len(&self, route_key: &str) -> usize {
        self.registry.lock().bucket_len(route_key)
    }

    pub fn route_keys(&self) -> Vec<String> {
        self.registry
            .lock()
            .route_keys()
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            records: self.registry.lock().total_records(),
        }
    }

    /// Drop every registered mock.
    pub fn clear(&self) {
        self.registry.lock().clear();
    }

    /// Resolve exactly one outcome for `request`.
    ///
    /// Fails with [`HarnessError::Unmocked`] when no bucket exists for the
    /// route key and with [`HarnessError::NoMatchingMock`] when nothing in
    /// the bucket applies (including a bucket emptied by one-shot records).
    pub async fn resolve(&self, request: InterceptedRequest) -> Result<RouteDisposition> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let view = RequestView::new(request);
        let record = match self.select(&view) {
            Ok(record) => record,
            Err(e) => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.requests_matched.fetch_add(1, Ordering::Relaxed);

        if self.settings.log_matches {
            info!(
                route_key = %view.route_key(),
                mock = record.label.as_deref().unwrap_or("-"),
                once = record.options.once,
                "Request matched mock"
            );
        }

        let delay_ms = record.options.delay_ms;
        if delay_ms > 0 {
            debug!(route_key = %view.route_key(), delay_ms, "Applying delay");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if let Some(error) = record.options.error {
            debug!(route_key = %view.route_key(), error = %error, "Simulating network error");
            return Ok(RouteDisposition::Abort(error));
        }

        let route = view.route_key().to_string();
        let value = match self.compute_value(&record.value, view).await {
            Ok(value) => value,
            Err(e) => {
                error!(route_key = %route, error = %e, "Mock value failed, aborting request");
                return Ok(RouteDisposition::Abort(NetworkError::Failed));
            }
        };

        Ok(RouteDisposition::Fulfill(build_response(&value, record.is_streaming)?))
    }

    /// Adapter installed on page routes.
    ///
    /// A bucket without a winner aborts the request; a missing bucket stays
    /// an error so the driver surfaces it to the test.
    pub async fn intercept(&self, request: InterceptedRequest) -> Result<RouteDisposition> {
        let method = request.method;
        let url = request.url.clone();

        match self.resolve(request).await {
            Err(HarnessError::NoMatchingMock { route_key, candidates }) => {
                if self.settings.log_unmatched {
                    warn!(route_key = %route_key, candidates, "No matching mock, aborting request");
                }
                Ok(RouteDisposition::Abort(NetworkError::Failed))
            }
            Err(e @ HarnessError::Unmocked { .. }) => {
                if self.settings.log_unmatched {
                    error!(method = %method, url = %url, "Unmocked request");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Pick the winning record, consuming it when it is one-shot.
    fn select(&self, view: &RequestView) -> Result<MockRecord> {
        let key = view.route_key();

        loop {
            // Snapshot so matchers run without the registry lock held.
            let bucket: Vec<MockRecord> = {
                let registry = self.registry.lock();
                match registry.bucket(key) {
                    Some(records) => records.to_vec(),
                    None => {
                        return Err(HarnessError::Unmocked {
                            route_key: key.to_string(),
                        })
                    }
                }
            };

            let mut fallback: Option<usize> = None;
            let mut winner: Option<usize> = None;

            for (idx, record) in bucket.iter().enumerate() {
                let Some(matcher) = &record.options.matcher else {
                    if fallback.is_none() {
                        fallback = Some(idx);
                    }
                    continue;
                };
                match matcher.evaluate(view) {
                    Ok(true) => {
                        winner = Some(idx);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(route_key = %key, error = %e, "Matcher failed, treating as no match");
                    }
                }
            }

            let Some(idx) = winner.or(fallback) else {
                return Err(HarnessError::NoMatchingMock {
                    route_key: key.to_string(),
                    candidates: bucket.len(),
                });
            };

            let record = bucket[idx].clone();
            if record.options.once {
                if self.registry.lock().take(key, record.id()).is_none() {
                    // Another request consumed it after the snapshot.
                    debug!(route_key = %key, "One-shot mock already taken, reselecting");
                    continue;
                }
                debug!(route_key = %key, "One-shot mock consumed");
            }
            return Ok(record);
        }
    }

    async fn compute_value(&self, value: &MockValue, view: RequestView) -> anyhow::Result<Value> {
        match value {
            MockValue::Static(v) => Ok(v.clone()),
            MockValue::Template(v) => Ok(self.template_engine.render_value(v, &view)?),
            MockValue::Computed(f) => f(view).await,
        }
    }
}

fn build_response(value: &Value, streaming: bool) -> Result<MockResponse> {
    let mut headers = HashMap::new();
    let body = if streaming {
        headers.insert("content-type".to_string(), EVENT_STREAM_CONTENT_TYPE.to_string());
        headers.insert("cache-control".to_string(), "no-cache".to_string());
        format_event_stream(value)
    } else {
        headers.insert("content-type".to_string(), "application/json".to_string());
        serde_json::to_string(value)?
    };

    Ok(MockResponse {
        status: 200,
        headers,
        body,
    })
}
