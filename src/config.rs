//! Configuration for the harness.
//!
//! Defines the host identity handed to the plugin, the mocked origins and
//! any mocks declared up front in a YAML file.

use crate::driver::NetworkError;
use crate::request::HttpMethod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration for one test environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Identifier of the plugin under test
    #[serde(default = "default_plugin_id")]
    pub plugin_id: String,

    /// Origins whose requests are intercepted
    #[serde(default)]
    pub origins: Origins,

    /// Host session handed to the plugin during the handshake
    #[serde(default)]
    pub session: SessionFixture,

    /// Starting state of the settings row
    #[serde(default)]
    pub initial_settings: InitialSettings,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Mocks registered during setup
    #[serde(default)]
    pub mocks: Vec<MockDefinition>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            plugin_id: default_plugin_id(),
            origins: Origins::default(),
            session: SessionFixture::default(),
            initial_settings: InitialSettings::default(),
            settings: GlobalSettings::default(),
            mocks: Vec::new(),
        }
    }
}

fn default_plugin_id() -> String {
    "plugin123".to_string()
}

impl HarnessConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.plugin_id.is_empty() {
            anyhow::bail!("plugin_id cannot be empty");
        }
        self.origins.validate()?;
        if let InitialSettings::Record { payload } = &self.initial_settings {
            if !payload.is_object() {
                anyhow::bail!("initial_settings payload must be an object");
            }
        }
        for (i, mock) in self.mocks.iter().enumerate() {
            mock.validate()
                .map_err(|e| anyhow::anyhow!("Mock {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// The two intercepted origins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Origins {
    /// Plugin backend (business logic, LLM endpoints)
    #[serde(default = "default_backend_origin")]
    pub backend: String,

    /// Data-storage REST API
    #[serde(default = "default_data_origin")]
    pub data: String,
}

impl Default for Origins {
    fn default() -> Self {
        Self {
            backend: default_backend_origin(),
            data: default_data_origin(),
        }
    }
}

fn default_backend_origin() -> String {
    "http://localhost:8787".to_string()
}

fn default_data_origin() -> String {
    "http://localhost:54321".to_string()
}

impl Origins {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, origin) in [("backend", &self.backend), ("data", &self.data)] {
            let url = url::Url::parse(origin)
                .map_err(|e| anyhow::anyhow!("Invalid {} origin {:?}: {}", name, origin, e))?;
            if !url.has_host() {
                anyhow::bail!("{} origin {:?} has no host", name, origin);
            }
        }
        Ok(())
    }

    /// Absolute URL for `path` on the chosen origin.
    pub fn url(&self, origin: OriginKind, path: &str) -> String {
        let base = match origin {
            OriginKind::Backend => &self.backend,
            OriginKind::Data => &self.data,
        };
        format!("{}{}", base.trim_end_matches('/'), path)
    }
}

/// Which intercepted origin a mock belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    #[default]
    Backend,
    Data,
}

/// Session metadata the host sends with the init event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionFixture {
    #[serde(default = "default_access_token")]
    pub access_token: String,

    /// Seconds from now until the token expires
    #[serde(default = "default_expires_in")]
    pub expires_in_secs: i64,

    #[serde(default = "default_user_id")]
    pub user_id: String,

    #[serde(default)]
    pub guild: GuildFixture,

    #[serde(default)]
    pub profile: ProfileFixture,

    #[serde(default = "default_installed_plugins")]
    pub installed_plugins: Vec<InstalledPlugin>,
}

impl Default for SessionFixture {
    fn default() -> Self {
        Self {
            access_token: default_access_token(),
            expires_in_secs: default_expires_in(),
            user_id: default_user_id(),
            guild: GuildFixture::default(),
            profile: ProfileFixture::default(),
            installed_plugins: default_installed_plugins(),
        }
    }
}

fn default_access_token() -> String {
    "test-access-token".to_string()
}

fn default_expires_in() -> i64 {
    3600
}

fn default_user_id() -> String {
    "user-test-1".to_string()
}

fn default_installed_plugins() -> Vec<InstalledPlugin> {
    vec![InstalledPlugin {
        id: "dictionary".to_string(),
        name: "Dictionary".to_string(),
        version: "1.0.0".to_string(),
    }]
}

/// Workspace the plugin is opened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GuildFixture {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
}

impl Default for GuildFixture {
    fn default() -> Self {
        Self {
            id: "guild-test-1".to_string(),
            name: "Test Guild".to_string(),
            description: Some("Guild used by automated tests".to_string()),
            icon_url: None,
        }
    }
}

/// Learner profile in the shape the plugin expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProfileFixture {
    pub display_name: String,
    pub native_language: String,
    pub target_language: String,
    pub skill_levels: HashMap<String, String>,
    pub goals: Vec<String>,
    pub companion: CompanionFixture,
}

impl Default for ProfileFixture {
    fn default() -> Self {
        let skill_levels = [("reading", "B1"), ("listening", "A2"), ("speaking", "A2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            display_name: "Test Learner".to_string(),
            native_language: "en".to_string(),
            target_language: "es".to_string(),
            skill_levels,
            goals: vec!["travel".to_string(), "conversation".to_string()],
            companion: CompanionFixture::default(),
        }
    }
}

/// Named companion persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompanionFixture {
    pub name: String,
    pub persona: String,
}

impl Default for CompanionFixture {
    fn default() -> Self {
        Self {
            name: "Luna".to_string(),
            persona: "friendly".to_string(),
        }
    }
}

/// A sibling plugin installed in the same guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstalledPlugin {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// Starting state of the settings row.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitialSettings {
    /// A row exists with an empty `settings` map
    #[default]
    Default,
    /// No row exists yet
    Absent,
    /// A row exists with this payload
    Record { payload: serde_json::Value },
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log every resolved mock
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests that found no mock
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A mock declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDefinition {
    /// Optional name, used in logs
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub origin: OriginKind,

    /// Path on the origin, starting with `/`
    pub path: String,

    /// Predicates that must all hold; none marks a fallback
    #[serde(default)]
    pub matcher: Vec<RequestPredicate>,

    /// Response value
    #[serde(default)]
    pub response: serde_json::Value,

    /// Render string fields of `response` as templates
    #[serde(default)]
    pub template: bool,

    /// Deliver `response` as an event stream
    #[serde(default)]
    pub streaming: bool,

    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub error: Option<NetworkError>,

    #[serde(default)]
    pub once: bool,
}

impl MockDefinition {
    /// Validate the mock definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.path.starts_with('/') {
            anyhow::bail!("path must start with '/': {:?}", self.path);
        }
        for predicate in &self.matcher {
            predicate.validate()?;
        }
        Ok(())
    }
}

/// Declarative request predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPredicate {
    /// Query parameter check
    Query {
        name: String,
        #[serde(flatten)]
        matcher: QueryMatcher,
    },
    /// Body check
    Body {
        #[serde(flatten)]
        matcher: BodyMatcher,
    },
    /// Substring of the (possibly synthesized) instructions field
    InstructionsContains { value: String },
}

impl RequestPredicate {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            RequestPredicate::Query {
                matcher: QueryMatcher::Regex { pattern },
                ..
            }
            | RequestPredicate::Body {
                matcher: BodyMatcher::Regex { pattern },
            } => {
                regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
            }
            RequestPredicate::Body {
                matcher: BodyMatcher::JsonPath { expressions },
            } => {
                for expr in expressions.keys() {
                    let parsed: Result<jsonpath_rust::JsonPath, _> =
                        jsonpath_rust::JsonPath::try_from(expr.as_str());
                    parsed.map_err(|e| anyhow::anyhow!("Invalid json path {:?}: {}", expr, e))?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum BodyMatcher {
    /// Exact body match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path expressions and expected values (null = path exists)
    JsonPath {
        expressions: HashMap<String, serde_json::Value>,
    },
    /// Body must contain substring
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be empty
    Empty,
}
