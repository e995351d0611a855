//! Settings state source.
//!
//! A single optional row, identified by plugin and guild, that backs the
//! settings mocks. Reads return the current row, PATCH merges into an
//! existing row and POST creates or merges.

use crate::request::RequestView;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Identity fields of the row. Never overwritten by merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsIdentity {
    pub id: String,
    pub plugin_id: String,
    pub guild_id: String,
}

impl SettingsIdentity {
    pub const FIELDS: [&'static str; 3] = ["id", "plugin_id", "guild_id"];

    pub fn new(plugin_id: impl Into<String>, guild_id: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        let guild_id = guild_id.into();
        Self {
            id: format!("{}:{}", plugin_id, guild_id),
            plugin_id,
            guild_id,
        }
    }

    fn base_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("id".to_string(), Value::String(self.id.clone()));
        record.insert("plugin_id".to_string(), Value::String(self.plugin_id.clone()));
        record.insert("guild_id".to_string(), Value::String(self.guild_id.clone()));
        record
    }
}

/// The settings row state machine: absent or present.
#[derive(Debug, Clone)]
pub struct SettingsState {
    identity: SettingsIdentity,
    record: Option<Map<String, Value>>,
}

impl SettingsState {
    /// No row exists.
    pub fn absent(identity: SettingsIdentity) -> Self {
        Self {
            identity,
            record: None,
        }
    }

    /// A row with an empty `settings` map.
    pub fn with_default(identity: SettingsIdentity) -> Self {
        let mut payload = Map::new();
        payload.insert("settings".to_string(), Value::Object(Map::new()));
        Self::with_record(identity, payload)
    }

    /// A row with `payload` merged over the identity fields.
    pub fn with_record(identity: SettingsIdentity, payload: Map<String, Value>) -> Self {
        let mut state = Self::absent(identity);
        state.insert(payload);
        state
    }

    pub fn identity(&self) -> &SettingsIdentity {
        &self.identity
    }

    pub fn is_present(&self) -> bool {
        self.record.is_some()
    }

    /// Current row, or `null`.
    pub fn get(&self) -> Value {
        self.record
            .as_ref()
            .map_or(Value::Null, |r| Value::Object(r.clone()))
    }

    /// Merge into an existing row. Empty when there is nothing to update.
    pub fn update(&mut self, partial: Map<String, Value>) -> Vec<Value> {
        match self.record.as_mut() {
            None => Vec::new(),
            Some(record) => {
                merge_payload(record, partial);
                vec![Value::Object(record.clone())]
            }
        }
    }

    /// Create or merge; the row is always present afterwards.
    pub fn insert(&mut self, partial: Map<String, Value>) -> Value {
        let identity = &self.identity;
        let record = self.record.get_or_insert_with(|| identity.base_record());
        merge_payload(record, partial);
        Value::Object(record.clone())
    }

    /// Replace the row directly, bypassing merge semantics.
    pub fn set_settings(&mut self, value: Option<Map<String, Value>>) {
        self.record = value;
    }
}

fn merge_payload(record: &mut Map<String, Value>, partial: Map<String, Value>) {
    for (key, value) in partial {
        if SettingsIdentity::FIELDS.contains(&key.as_str()) {
            continue;
        }
        record.insert(key, value);
    }
}

/// Object payload of a request body; single-row arrays are unwrapped.
fn body_object(req: &RequestView) -> Option<Map<String, Value>> {
    match req.raw_json()? {
        Value::Object(obj) => Some(obj.clone()),
        Value::Array(rows) if rows.len() == 1 => rows[0].as_object().cloned(),
        _ => None,
    }
}

/// Cloneable handle shared between the facade and the settings mocks.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<Mutex<SettingsState>>,
}

impl SharedSettings {
    pub fn new(state: SettingsState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn get(&self) -> Value {
        self.inner.lock().get()
    }

    pub fn update(&self, partial: Map<String, Value>) -> Vec<Value> {
        self.inner.lock().update(partial)
    }

    pub fn insert(&self, partial: Map<String, Value>) -> Value {
        self.inner.lock().insert(partial)
    }

    pub fn set_settings(&self, value: Option<Map<String, Value>>) {
        self.inner.lock().set_settings(value);
    }

    /// Response for a read.
    pub fn get_value(&self, _req: &RequestView) -> Value {
        self.get()
    }

    /// Response for a PATCH; malformed bodies update nothing.
    pub fn patch_value(&self, req: &RequestView) -> Value {
        match body_object(req) {
            Some(partial) => Value::Array(self.update(partial)),
            None => {
                tracing::debug!(url = %req.url(), "Settings PATCH body is not an object, nothing updated");
                Value::Array(Vec::new())
            }
        }
    }

    /// Response for a POST; malformed bodies update nothing.
    pub fn post_value(&self, req: &RequestView) -> Value {
        match body_object(req) {
            Some(partial) => self.insert(partial),
            None => {
                tracing::debug!(url = %req.url(), "Settings POST body is not an object, nothing inserted");
                Value::Array(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HttpMethod, InterceptedRequest};
    use serde_json::json;

    fn identity() -> SettingsIdentity {
        SettingsIdentity::new("plugin123", "guild-1")
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_default_record() {
        let state = SettingsState::with_default(identity());
        let row = state.get();
        assert_eq!(row["settings"], json!({}));
        assert_eq!(row["plugin_id"], "plugin123");
        assert_eq!(row["guild_id"], "guild-1");
    }

    #[test]
    fn test_get_is_idempotent() {
        let state = SettingsState::with_default(identity());
        assert_eq!(state.get(), state.get());
        let absent = SettingsState::absent(identity());
        assert_eq!(absent.get(), Value::Null);
        assert_eq!(absent.get(), absent.get());
    }

    #[test]
    fn test_update_absent_is_empty() {
        let mut state = SettingsState::absent(identity());
        assert!(state.update(obj(json!({"settings": {"a": 1}}))).is_empty());
        assert!(!state.is_present());
    }

    #[test]
    fn test_update_present_merges() {
        let mut state = SettingsState::with_default(identity());
        let rows = state.update(obj(json!({"settings": {"theme": "dark"}, "enabled": true})));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["settings"]["theme"], "dark");
        assert_eq!(rows[0]["enabled"], true);
        assert_eq!(state.get(), rows[0]);
    }

    #[test]
    fn test_insert_merge_law() {
        let mut state = SettingsState::with_record(identity(), obj(json!({"settings": {}, "level": 1})));
        let before = state.get();
        let partial = obj(json!({"level": 2, "plugin_id": "hijack", "extra": "x"}));
        let returned = state.insert(partial);
        let after = state.get();

        assert_eq!(returned, after);
        assert_eq!(after["level"], 2);
        assert_eq!(after["extra"], "x");
        assert_eq!(after["settings"], before["settings"]);
        // Identity survives the merge.
        assert_eq!(after["plugin_id"], "plugin123");
        assert_eq!(after["id"], before["id"]);
    }

    #[test]
    fn test_insert_from_absent_creates() {
        let mut state = SettingsState::absent(identity());
        let row = state.insert(obj(json!({"settings": {"a": 1}})));
        assert!(state.is_present());
        assert_eq!(row["settings"]["a"], 1);
        assert_eq!(row["guild_id"], "guild-1");
    }

    #[test]
    fn test_set_settings_overrides() {
        let mut state = SettingsState::with_default(identity());
        state.set_settings(None);
        assert_eq!(state.get(), Value::Null);
        state.set_settings(Some(obj(json!({"raw": true}))));
        assert_eq!(state.get(), json!({"raw": true}));
    }

    #[test]
    fn test_shared_patch_with_malformed_body() {
        let shared = SharedSettings::new(SettingsState::with_default(identity()));
        let req = RequestView::new(
            InterceptedRequest::new(HttpMethod::Patch, "https://d.test/rest/v1/settings").with_body("{oops"),
        );
        assert_eq!(shared.patch_value(&req), json!([]));
        assert_eq!(shared.get()["settings"], json!({}));
    }

    #[test]
    fn test_shared_post_unwraps_single_row() {
        let shared = SharedSettings::new(SettingsState::absent(identity()));
        let req = RequestView::new(
            InterceptedRequest::new(HttpMethod::Post, "https://d.test/rest/v1/settings")
                .with_json(&json!([{"settings": {"goal": 10}}])),
        );
        let row = shared.post_value(&req);
        assert_eq!(row["settings"]["goal"], 10);
        assert_eq!(shared.get(), row);
    }
}
