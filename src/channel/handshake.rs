//! Scripts run inside the page and the init payload they deliver.
//!
//! Every script is a function expression taking one JSON argument, so the
//! driver can pass configuration without string interpolation.

use super::message::{ACK_SIGNAL, HELLO_SIGNAL, INIT_EVENT};
use crate::config::{GuildFixture, HarnessConfig, InstalledPlugin, ProfileFixture};
use serde::Serialize;
use serde_json::{json, Value};

/// Binding the page calls with a `hello` signal.
pub const HELLO_BINDING: &str = "__pluginHostHello";
/// Binding the page calls with every message the plugin posts on its port.
pub const INBOUND_BINDING: &str = "__pluginHostInbound";

/// Replaces `window.parent` with a host stand-in.
///
/// The stand-in is a distinct object, so `window.parent !== window` holds
/// inside the plugin. Handshake signals are consumed; every other message
/// goes to the real `window.postMessage`.
pub const HANDSHAKE_SCRIPT: &str = r#"(config) => {
  const realPostMessage = window.postMessage.bind(window);
  const host = {
    __pluginHost: true,
    postMessage(message, targetOrigin, transfer) {
      const type = message && typeof message === 'object' ? message.type : undefined;
      if (type === config.helloSignal) {
        window[config.helloBinding](message);
        return;
      }
      if (type === config.ackSignal) {
        return;
      }
      return realPostMessage(message, targetOrigin === undefined ? '*' : targetOrigin, transfer);
    },
  };
  Object.defineProperty(window, 'parent', { get: () => host, configurable: true });
}"#;

/// Creates the dedicated channel and dispatches the init event.
///
/// `port2` travels with the init event; `port1` stays in the page and
/// forwards plugin messages to the inbound binding.
pub const OPEN_CHANNEL_SCRIPT: &str = r#"({ init, inboundBinding }) => {
  const channel = new MessageChannel();
  window.__pluginHostPort = channel.port1;
  channel.port1.onmessage = (event) => window[inboundBinding](event.data);
  channel.port1.start();
  window.dispatchEvent(new MessageEvent('message', { data: init, ports: [channel.port2] }));
  return true;
}"#;

/// Posts one envelope to the plugin over the retained port.
pub const POST_TO_PLUGIN_SCRIPT: &str = r#"(envelope) => {
  window.__pluginHostPort.postMessage(envelope);
}"#;

/// Argument for [`HANDSHAKE_SCRIPT`].
pub fn handshake_arg() -> Value {
    json!({
        "helloSignal": HELLO_SIGNAL,
        "ackSignal": ACK_SIGNAL,
        "helloBinding": HELLO_BINDING,
    })
}

/// Argument for [`OPEN_CHANNEL_SCRIPT`].
pub fn open_channel_arg(init: &InitPayload) -> serde_json::Result<Value> {
    Ok(json!({
        "init": serde_json::to_value(init)?,
        "inboundBinding": INBOUND_BINDING,
    }))
}

/// Access credentials handed to the plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub access_token: String,
    /// Milliseconds since the Unix epoch
    pub expires_at: i64,
    pub user_id: String,
    pub data_api_url: String,
    pub backend_api_url: String,
}

/// Host session metadata delivered once with the init event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub plugin_id: String,
    pub session: SessionInfo,
    pub guild: GuildFixture,
    pub profile: ProfileFixture,
    pub installed_plugins: Vec<InstalledPlugin>,
}

impl InitPayload {
    /// Payload for `config`, with the token expiring relative to now.
    pub fn from_config(config: &HarnessConfig) -> Self {
        let session = &config.session;
        let expires_at = chrono::Utc::now().timestamp_millis() + session.expires_in_secs * 1000;
        Self {
            kind: INIT_EVENT,
            plugin_id: config.plugin_id.clone(),
            session: SessionInfo {
                access_token: session.access_token.clone(),
                expires_at,
                user_id: session.user_id.clone(),
                data_api_url: config.origins.data.clone(),
                backend_api_url: config.origins.backend.clone(),
            },
            guild: session.guild.clone(),
            profile: session.profile.clone(),
            installed_plugins: session
                .installed_plugins
                .iter()
                .filter(|p| p.id != config.plugin_id)
                .cloned()
                .collect(),
        }
    }
}
