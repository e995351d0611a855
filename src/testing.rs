//! In-memory page driver.
//!
//! `FakePage` records what the harness installs and plays the plugin's
//! side of the handshake, so environments can be exercised without a
//! browser.

use crate::channel::handshake::{
    HANDSHAKE_SCRIPT, HELLO_BINDING, INBOUND_BINDING, OPEN_CHANNEL_SCRIPT, POST_TO_PLUGIN_SCRIPT,
};
use crate::channel::message::{ChannelEnvelope, ACK_SIGNAL, HELLO_SIGNAL};
use crate::driver::{PageBinding, PageDriver, RouteDisposition, RouteHandler};
use crate::error::HarnessError;
use crate::request::InterceptedRequest;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

struct Route {
    pattern: String,
    matcher: globset::GlobMatcher,
    handler: RouteHandler,
}

#[derive(Default)]
struct PageState {
    routes: Vec<Route>,
    init_scripts: Vec<(String, Value)>,
    bindings: HashMap<String, PageBinding>,
    init_payload: Option<Value>,
    channels_opened: usize,
    delivered: Vec<ChannelEnvelope>,
    forwarded: Vec<Value>,
}

/// Page stand-in that keeps everything in memory.
#[derive(Default)]
pub struct FakePage {
    state: Mutex<PageState>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send an intercepted request through the most recently added
    /// matching route.
    pub async fn request(&self, request: InterceptedRequest) -> Result<RouteDisposition, HarnessError> {
        let handler = {
            let state = self.state.lock();
            state
                .routes
                .iter()
                .rev()
                .find(|r| r.matcher.is_match(&request.url))
                .map(|r| r.handler.clone())
        };
        match handler {
            Some(handler) => handler(request).await,
            None => Err(HarnessError::Driver(anyhow::anyhow!(
                "no route for {} {}; the request would reach the network",
                request.method,
                request.url
            ))),
        }
    }

    /// Post `message` to `window.parent` as the plugin would.
    ///
    /// With the handshake script installed, handshake signals go to the
    /// hello binding and everything else is forwarded to the window.
    pub async fn post_to_parent(&self, message: Value) -> anyhow::Result<()> {
        let intercepted = self
            .state
            .lock()
            .init_scripts
            .iter()
            .any(|(script, _)| script == HANDSHAKE_SCRIPT);
        let kind = message.get("type").and_then(Value::as_str);

        if intercepted && kind == Some(HELLO_SIGNAL) {
            self.call_binding(HELLO_BINDING, message).await?;
        } else if intercepted && kind == Some(ACK_SIGNAL) {
            debug!("Ack consumed by handshake interception");
        } else {
            self.state.lock().forwarded.push(message);
        }
        Ok(())
    }

    /// Post the plugin's hello signal.
    pub async fn plugin_hello(&self, plugin_id: &str) -> anyhow::Result<()> {
        self.post_to_parent(json!({"type": HELLO_SIGNAL, "pluginId": plugin_id}))
            .await
    }

    /// Post `message` over the plugin's end of the channel.
    pub async fn plugin_send(&self, message: Value) -> anyhow::Result<()> {
        if self.state.lock().init_payload.is_none() {
            anyhow::bail!("plugin has no channel port yet");
        }
        self.call_binding(INBOUND_BINDING, message).await?;
        Ok(())
    }

    /// Invoke an exposed binding directly.
    pub async fn call_binding(&self, name: &str, arg: Value) -> anyhow::Result<Value> {
        let binding = self.state.lock().bindings.get(name).cloned();
        match binding {
            Some(binding) => binding(arg).await,
            None => anyhow::bail!("window.{} is not a function", name),
        }
    }

    pub fn route_patterns(&self) -> Vec<String> {
        self.state.lock().routes.iter().map(|r| r.pattern.clone()).collect()
    }

    pub fn init_scripts(&self) -> Vec<(String, Value)> {
        self.state.lock().init_scripts.clone()
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.state.lock().bindings.contains_key(name)
    }

    /// Init event dispatched into the page, if the channel was opened.
    pub fn init_payload(&self) -> Option<Value> {
        self.state.lock().init_payload.clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    /// Everything the host posted to the plugin, in order.
    pub fn delivered(&self) -> Vec<ChannelEnvelope> {
        self.state.lock().delivered.clone()
    }

    /// Messages that reached the real `window.postMessage`.
    pub fn forwarded(&self) -> Vec<Value> {
        self.state.lock().forwarded.clone()
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn route(&self, pattern: &str, handler: RouteHandler) -> anyhow::Result<()> {
        let matcher = globset::Glob::new(pattern)?.compile_matcher();
        self.state.lock().routes.push(Route {
            pattern: pattern.to_string(),
            matcher,
            handler,
        });
        Ok(())
    }

    async fn add_init_script(&self, script: &str, arg: Value) -> anyhow::Result<()> {
        self.state.lock().init_scripts.push((script.to_string(), arg));
        Ok(())
    }

    async fn expose_binding(&self, name: &str, binding: PageBinding) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.bindings.contains_key(name) {
            anyhow::bail!("function {:?} has already been registered", name);
        }
        state.bindings.insert(name.to_string(), binding);
        Ok(())
    }

    async fn evaluate(&self, script: &str, arg: Value) -> anyhow::Result<Value> {
        let mut state = self.state.lock();
        if script == OPEN_CHANNEL_SCRIPT {
            state.init_payload = arg.get("init").cloned();
            state.channels_opened += 1;
            Ok(Value::Bool(true))
        } else if script == POST_TO_PLUGIN_SCRIPT {
            if state.init_payload.is_none() {
                anyhow::bail!("cannot read properties of undefined (reading 'postMessage')");
            }
            state.delivered.push(serde_json::from_value(arg)?);
            Ok(Value::Null)
        } else {
            Ok(Value::Null)
        }
    }
}
