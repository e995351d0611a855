//! Test environment: one engine and one channel per test.
//!
//! `TestEnvironment` routes both origins through the resolution engine,
//! installs the channel and exposes namespaced helpers that translate into
//! registrations on well-known routes and topics.

use crate::channel::handshake::InitPayload;
use crate::channel::{MessageChannelSimulator, Reply, ResponderHandle};
use crate::config::{HarnessConfig, InitialSettings, OriginKind};
use crate::driver::{PageDriver, RouteHandler};
use crate::engine::MockResolutionEngine;
use crate::error::{HarnessError, Result};
use crate::registry::{MockOptions, MockRecord, MockValue};
use crate::request::{route_key, HttpMethod};
use crate::settings::{SettingsIdentity, SettingsState, SharedSettings};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings row endpoint on the data origin.
pub const SETTINGS_PATH: &str = "/rest/v1/plugin_settings";
/// Generic table endpoints live under this prefix on the data origin.
pub const TABLES_PATH: &str = "/rest/v1";
/// Completion endpoint on the backend origin.
pub const LLM_PATH: &str = "/api/llm";
/// Streaming completion endpoint on the backend origin.
pub const LLM_STREAM_PATH: &str = "/api/llm/stream";

/// Harness for one plugin page.
pub struct TestEnvironment {
    config: HarnessConfig,
    page: Arc<dyn PageDriver>,
    engine: Arc<MockResolutionEngine>,
    channel: MessageChannelSimulator,
    settings: SharedSettings,
    set_up: AtomicBool,
    /// Page routes survive teardown and are installed once
    routed: AtomicBool,
}

impl TestEnvironment {
    pub fn new(config: HarnessConfig, page: Arc<dyn PageDriver>) -> Self {
        let engine = Arc::new(MockResolutionEngine::new(config.settings.clone()));
        let channel = MessageChannelSimulator::new(page.clone(), InitPayload::from_config(&config));

        let identity = SettingsIdentity::new(&config.plugin_id, &config.session.guild.id);
        let state = match &config.initial_settings {
            InitialSettings::Default => SettingsState::with_default(identity),
            InitialSettings::Absent => SettingsState::absent(identity),
            InitialSettings::Record { payload } => match payload {
                Value::Object(map) => SettingsState::with_record(identity, map.clone()),
                other => {
                    warn!(payload = %other, "Initial settings payload is not an object, starting empty");
                    SettingsState::with_record(identity, Map::new())
                }
            },
        };

        Self {
            config,
            page,
            engine,
            channel,
            settings: SharedSettings::new(state),
            set_up: AtomicBool::new(false),
            routed: AtomicBool::new(false),
        }
    }

    /// Route both origins, install the channel and register configured mocks.
    pub async fn setup(&self) -> Result<()> {
        if self.set_up.load(Ordering::Acquire) {
            return Ok(());
        }

        let origins = &self.config.origins;
        if !self.routed.load(Ordering::Acquire) {
            for origin in [&origins.backend, &origins.data] {
                let pattern = format!("{}/**", origin.trim_end_matches('/'));
                self.page
                    .route(&pattern, self.route_handler())
                    .await
                    .map_err(HarnessError::Driver)?;
                debug!(pattern = %pattern, "Routing origin through mocks");
            }
            self.routed.store(true, Ordering::Release);
        }

        self.channel.install().await?;

        for def in &self.config.mocks {
            let key = self.engine.register_definition(origins, def)?;
            debug!(route_key = %key, mock = def.id.as_deref().unwrap_or("-"), "Registered configured mock");
        }

        self.set_up.store(true, Ordering::Release);
        info!(
            plugin_id = %self.config.plugin_id,
            mocks = self.config.mocks.len(),
            "Test environment ready"
        );
        Ok(())
    }

    fn route_handler(&self) -> RouteHandler {
        let engine = Arc::clone(&self.engine);
        Arc::new(move |request| {
            let engine = Arc::clone(&engine);
            async move { engine.intercept(request).await }.boxed()
        })
    }

    /// Drop every mock, listener and responder.
    ///
    /// A later `setup()` registers the configured mocks again on the
    /// existing routes.
    pub fn teardown(&self) {
        self.engine.clear();
        self.channel.clear();
        self.set_up.store(false, Ordering::Release);
        debug!(plugin_id = %self.config.plugin_id, "Test environment torn down");
    }

    pub fn is_set_up(&self) -> bool {
        self.set_up.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn engine(&self) -> &MockResolutionEngine {
        &self.engine
    }

    pub fn channel(&self) -> &MessageChannelSimulator {
        &self.channel
    }

    /// State behind the default settings mocks.
    pub fn settings_state(&self) -> &SharedSettings {
        &self.settings
    }

    /// Resolves once the plugin has completed the handshake.
    pub async fn wait_for_plugin(&self) {
        self.channel.wait_until_ready().await;
    }

    /// Register `value` for `method url`. Returns the route key.
    ///
    /// A method set in `options` takes precedence over `method`.
    pub fn mock(
        &self,
        method: HttpMethod,
        url: &str,
        value: impl Into<MockValue>,
        options: MockOptions,
    ) -> Result<String> {
        self.register(MockRecord::new(method, value).with_options(options), url)
    }

    /// Like [`mock`](Self::mock), answering with an event stream.
    pub fn mock_stream(
        &self,
        method: HttpMethod,
        url: &str,
        value: impl Into<MockValue>,
        options: MockOptions,
    ) -> Result<String> {
        self.register(MockRecord::new(method, value).with_options(options).streaming(), url)
    }

    fn register(&self, record: MockRecord, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).map_err(|e| HarnessError::InvalidRoute {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !parsed.has_host() {
            return Err(HarnessError::InvalidRoute {
                url: url.to_string(),
                reason: "url has no host".to_string(),
            });
        }
        let key = route_key(record.method, url);
        self.engine.register(key.clone(), record);
        Ok(key)
    }

    fn url(&self, origin: OriginKind, path: &str) -> String {
        self.config.origins.url(origin, path)
    }

    pub fn settings(&self) -> SettingsMocks<'_> {
        SettingsMocks { env: self }
    }

    pub fn tables(&self) -> TableMocks<'_> {
        TableMocks { env: self }
    }

    pub fn llm(&self) -> LlmMocks<'_> {
        LlmMocks { env: self }
    }

    pub fn events(&self) -> EventTriggers<'_> {
        EventTriggers { env: self }
    }
}

/// Mocks for the plugin's settings row.
///
/// Without an override every call is backed by the shared settings state.
pub struct SettingsMocks<'a> {
    env: &'a TestEnvironment,
}

impl SettingsMocks<'_> {
    fn url(&self) -> String {
        self.env.url(OriginKind::Data, SETTINGS_PATH)
    }

    pub fn get(&self, value: Option<MockValue>, options: MockOptions) -> Result<String> {
        let value = value.unwrap_or_else(|| {
            let state = self.env.settings.clone();
            MockValue::from_fn(move |req| Ok(state.get_value(req)))
        });
        self.env.mock(HttpMethod::Get, &self.url(), value, options)
    }

    pub fn patch(&self, value: Option<MockValue>, options: MockOptions) -> Result<String> {
        let value = value.unwrap_or_else(|| {
            let state = self.env.settings.clone();
            MockValue::from_fn(move |req| Ok(state.patch_value(req)))
        });
        self.env.mock(HttpMethod::Patch, &self.url(), value, options)
    }

    pub fn post(&self, value: Option<MockValue>, options: MockOptions) -> Result<String> {
        let value = value.unwrap_or_else(|| {
            let state = self.env.settings.clone();
            MockValue::from_fn(move |req| Ok(state.post_value(req)))
        });
        self.env.mock(HttpMethod::Post, &self.url(), value, options)
    }
}

/// Mocks for REST tables on the data origin.
pub struct TableMocks<'a> {
    env: &'a TestEnvironment,
}

impl TableMocks<'_> {
    fn url(&self, table: &str) -> String {
        self.env
            .url(OriginKind::Data, &format!("{}/{}", TABLES_PATH, table.trim_start_matches('/')))
    }

    pub fn select(&self, table: &str, value: impl Into<MockValue>, options: MockOptions) -> Result<String> {
        self.env.mock(HttpMethod::Get, &self.url(table), value, options)
    }

    pub fn insert(&self, table: &str, value: impl Into<MockValue>, options: MockOptions) -> Result<String> {
        self.env.mock(HttpMethod::Post, &self.url(table), value, options)
    }

    pub fn update(&self, table: &str, value: impl Into<MockValue>, options: MockOptions) -> Result<String> {
        self.env.mock(HttpMethod::Patch, &self.url(table), value, options)
    }

    pub fn delete(&self, table: &str, value: impl Into<MockValue>, options: MockOptions) -> Result<String> {
        self.env.mock(HttpMethod::Delete, &self.url(table), value, options)
    }
}

/// Mocks for the completion endpoints on the backend origin.
pub struct LlmMocks<'a> {
    env: &'a TestEnvironment,
}

impl LlmMocks<'_> {
    pub fn complete(&self, value: impl Into<MockValue>, options: MockOptions) -> Result<String> {
        let url = self.env.url(OriginKind::Backend, LLM_PATH);
        self.env.mock(HttpMethod::Post, &url, value, options)
    }

    pub fn stream(&self, value: impl Into<MockValue>, options: MockOptions) -> Result<String> {
        let url = self.env.url(OriginKind::Backend, LLM_STREAM_PATH);
        self.env.mock_stream(HttpMethod::Post, &url, value, options)
    }
}

/// Host-initiated actions the plugin asks for over the channel.
///
/// Topics are `{plugin_id}.action.{action}`.
pub struct EventTriggers<'a> {
    env: &'a TestEnvironment,
}

impl EventTriggers<'_> {
    fn ensure_set_up(&self, operation: &'static str) -> Result<()> {
        if self.env.is_set_up() {
            Ok(())
        } else {
            Err(HarnessError::NotSetUp { operation })
        }
    }

    pub fn topic(&self, action: &str) -> String {
        format!("{}.action.{}", self.env.config.plugin_id, action)
    }

    /// Answer the next sidebar request with `payload`.
    pub fn request_sidebar(&self, payload: Value) -> Result<ResponderHandle> {
        self.ensure_set_up("events().request_sidebar")?;
        Ok(self.env.channel.respond_once(self.topic("requestSidebar"), payload))
    }

    /// Answer the next main-view request with `payload`.
    pub fn request_main(&self, payload: Value) -> Result<ResponderHandle> {
        self.ensure_set_up("events().request_main")?;
        Ok(self.env.channel.respond_once(self.topic("requestMain"), payload))
    }

    /// Answer the next request for `action`.
    pub fn once(&self, action: &str, reply: impl Into<Reply>) -> Result<ResponderHandle> {
        self.ensure_set_up("events().once")?;
        Ok(self.env.channel.respond_once(self.topic(action), reply))
    }

    /// Answer every request for `action` until the handle is removed.
    pub fn always(&self, action: &str, reply: impl Into<Reply>) -> Result<ResponderHandle> {
        self.ensure_set_up("events().always")?;
        Ok(self.env.channel.respond(self.topic(action), reply))
    }

    /// Send an event to the plugin as the host.
    pub async fn emit(&self, topic: &str, data: Value) -> Result<()> {
        self.ensure_set_up("events().emit")?;
        self.env.channel.emit(topic, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RouteDisposition;
    use crate::request::InterceptedRequest;
    use crate::testing::FakePage;
    use serde_json::json;

    fn env() -> (Arc<FakePage>, TestEnvironment) {
        let page = Arc::new(FakePage::new());
        let env = TestEnvironment::new(HarnessConfig::default(), page.clone());
        (page, env)
    }

    #[tokio::test]
    async fn test_setup_routes_both_origins() {
        let (page, env) = env();
        env.setup().await.unwrap();
        env.setup().await.unwrap();

        assert_eq!(
            page.route_patterns(),
            vec!["http://localhost:8787/**", "http://localhost:54321/**"]
        );
        assert!(env.is_set_up());
    }

    #[tokio::test]
    async fn test_triggers_require_setup() {
        let (_page, env) = env();
        let err = env.events().request_main(json!({})).unwrap_err();
        assert!(matches!(err, HarnessError::NotSetUp { operation: "events().request_main" }));
        assert!(matches!(
            env.events().emit("x", json!(1)).await,
            Err(HarnessError::NotSetUp { .. })
        ));
    }

    #[test]
    fn test_namespace_route_keys() {
        let (_page, env) = env();
        assert_eq!(
            env.settings().get(None, MockOptions::new()).unwrap(),
            "GET http://localhost:54321/rest/v1/plugin_settings"
        );
        assert_eq!(
            env.tables().update("words", json!([]), MockOptions::new()).unwrap(),
            "PATCH http://localhost:54321/rest/v1/words"
        );
        assert_eq!(
            env.llm().stream(json!("hi"), MockOptions::new()).unwrap(),
            "POST http://localhost:8787/api/llm/stream"
        );
        assert_eq!(env.events().topic("requestSidebar"), "plugin123.action.requestSidebar");
    }

    #[test]
    fn test_method_option_overrides_namespace_default() {
        let (_page, env) = env();
        let key = env
            .tables()
            .select("words", json!([]), MockOptions::new().method(HttpMethod::Put))
            .unwrap();
        assert_eq!(key, "PUT http://localhost:54321/rest/v1/words");
    }

    #[test]
    fn test_mock_rejects_relative_url() {
        let (_page, env) = env();
        let err = env
            .mock(HttpMethod::Get, "/rest/v1/words", json!([]), MockOptions::new())
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidRoute { .. }));
    }

    #[tokio::test]
    async fn test_teardown_clears_mocks() {
        let (page, env) = env();
        env.setup().await.unwrap();
        env.tables().select("words", json!([]), MockOptions::new()).unwrap();
        env.teardown();

        let req = InterceptedRequest::new(HttpMethod::Get, "http://localhost:54321/rest/v1/words");
        assert!(matches!(page.request(req).await, Err(HarnessError::Unmocked { .. })));
        assert!(!env.is_set_up());
    }

    #[tokio::test]
    async fn test_setup_after_teardown_restores_environment() {
        let yaml = r#"
mocks:
  - method: GET
    path: /api/health
    response: {"ok": true}
"#;
        let page = Arc::new(FakePage::new());
        let env = TestEnvironment::new(HarnessConfig::from_yaml(yaml).unwrap(), page.clone());
        env.setup().await.unwrap();
        env.teardown();
        env.setup().await.unwrap();

        assert_eq!(
            page.route_patterns(),
            vec!["http://localhost:8787/**", "http://localhost:54321/**"]
        );
        assert!(env.channel().has_responder(crate::channel::ACCESS_TOKEN_TOPIC));
        assert!(env.channel().has_responder(crate::channel::PROFILE_TOPIC));
        assert!(env.events().request_main(json!({})).is_ok());

        let req = InterceptedRequest::new(HttpMethod::Get, "http://localhost:8787/api/health");
        match page.request(req).await.unwrap() {
            RouteDisposition::Fulfill(resp) => assert_eq!(resp.json().unwrap(), json!({"ok": true})),
            other => panic!("Expected fulfillment, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_absent_initial_settings() {
        let page = Arc::new(FakePage::new());
        let config = HarnessConfig {
            initial_settings: InitialSettings::Absent,
            ..HarnessConfig::default()
        };
        let env = TestEnvironment::new(config, page.clone());
        env.setup().await.unwrap();
        env.settings().get(None, MockOptions::new()).unwrap();

        let req = InterceptedRequest::new(HttpMethod::Get, "http://localhost:54321/rest/v1/plugin_settings");
        match page.request(req).await.unwrap() {
            RouteDisposition::Fulfill(resp) => assert_eq!(resp.json().unwrap(), Value::Null),
            other => panic!("Expected fulfillment, got {:?}", other),
        }
    }
}
