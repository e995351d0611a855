//! Simulated host side of the plugin message channel.

use super::handshake::{
    handshake_arg, open_channel_arg, InitPayload, HANDSHAKE_SCRIPT, HELLO_BINDING,
    INBOUND_BINDING, OPEN_CHANNEL_SCRIPT, POST_TO_PLUGIN_SCRIPT,
};
use super::message::{
    classify_inbound, ChannelEnvelope, EventBusMessage, EventResponse, HandshakeSignal, Inbound,
    HOST_SENDER,
};
use crate::config::ProfileFixture;
use crate::driver::{PageBinding, PageDriver};
use crate::error::{HarnessError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Topic the plugin uses to request fresh credentials.
pub const ACCESS_TOKEN_TOPIC: &str = "host.auth.requestAccessToken";
/// Topic the plugin uses to request the learner profile.
pub const PROFILE_TOPIC: &str = "host.profile.requestCurrent";

type ListenerFn = dyn Fn(EventBusMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
type ReplyFn = dyn Fn(EventBusMessage) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// Handshake script not injected yet
    Detached,
    /// Injected, waiting for the plugin's hello
    AwaitingHandshake,
    /// Channel open, queue flushed
    Ready,
}

/// What an auto-responder answers with.
#[derive(Clone)]
pub enum Reply {
    /// Same value for every request
    Static(Value),
    /// Computed from the triggering event
    Computed(Arc<ReplyFn>),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Reply::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl Reply {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&EventBusMessage) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Reply::Computed(Arc::new(move |event| {
            let result = f(&event);
            async move { result }.boxed()
        }))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(EventBusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Reply::Computed(Arc::new(move |event| f(event).boxed()))
    }

    async fn produce(&self, event: EventBusMessage) -> anyhow::Result<Value> {
        match self {
            Reply::Static(v) => Ok(v.clone()),
            Reply::Computed(f) => f(event).await,
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Static(value)
    }
}

struct Responder {
    id: u64,
    once: bool,
    reply: Reply,
}

struct ChannelState {
    phase: ChannelPhase,
    /// Set while the channel is being opened and the queue flushed
    opening: bool,
    pending: VecDeque<ChannelEnvelope>,
}

struct ChannelInner {
    page: Arc<dyn PageDriver>,
    plugin_id: String,
    session: Arc<RwLock<InitPayload>>,
    state: Mutex<ChannelState>,
    listeners: Mutex<HashMap<String, Vec<(u64, Arc<ListenerFn>)>>>,
    responders: Mutex<HashMap<String, Responder>>,
    next_id: AtomicU64,
    ready: watch::Sender<bool>,
}

/// Host end of the channel between the test and one plugin page.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct MessageChannelSimulator {
    inner: Arc<ChannelInner>,
}

impl MessageChannelSimulator {
    /// Simulator for the plugin described by `init`, with the built-in
    /// credential and profile responders registered.
    pub fn new(page: Arc<dyn PageDriver>, init: InitPayload) -> Self {
        let (ready, _) = watch::channel(false);
        let sim = Self {
            inner: Arc::new(ChannelInner {
                page,
                plugin_id: init.plugin_id.clone(),
                session: Arc::new(RwLock::new(init)),
                state: Mutex::new(ChannelState {
                    phase: ChannelPhase::Detached,
                    opening: false,
                    pending: VecDeque::new(),
                }),
                listeners: Mutex::new(HashMap::new()),
                responders: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                ready,
            }),
        };
        sim.register_builtin_responders();
        sim
    }

    fn register_builtin_responders(&self) {
        let session = Arc::clone(&self.inner.session);
        self.respond(
            ACCESS_TOKEN_TOPIC,
            Reply::from_fn(move |_| {
                let session = session.read();
                Ok(json!({
                    "accessToken": session.session.access_token,
                    "expiresAt": session.session.expires_at,
                }))
            }),
        );

        let session = Arc::clone(&self.inner.session);
        self.respond(
            PROFILE_TOPIC,
            Reply::from_fn(move |_| Ok(serde_json::to_value(&session.read().profile)?)),
        );
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn phase(&self) -> ChannelPhase {
        self.inner.state.lock().phase
    }

    /// Messages waiting for the channel to open.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Current init payload, as the next handshake would deliver it.
    pub fn init_payload(&self) -> InitPayload {
        self.inner.session.read().clone()
    }

    pub fn set_profile(&self, profile: ProfileFixture) {
        self.inner.session.write().profile = profile;
    }

    pub fn set_access_token(&self, access_token: impl Into<String>, expires_at: i64) {
        let mut session = self.inner.session.write();
        session.session.access_token = access_token.into();
        session.session.expires_at = expires_at;
    }

    /// Inject the handshake script and expose the page bindings.
    ///
    /// Calling it again once installed is a no-op.
    pub async fn install(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != ChannelPhase::Detached {
                return Ok(());
            }
            state.phase = ChannelPhase::AwaitingHandshake;
        }

        let page = &self.inner.page;
        page.add_init_script(HANDSHAKE_SCRIPT, handshake_arg())
            .await
            .map_err(HarnessError::Driver)?;
        page.expose_binding(HELLO_BINDING, self.binding(|sim, value| sim.handle_hello(value)))
            .await
            .map_err(HarnessError::Driver)?;
        page.expose_binding(INBOUND_BINDING, self.binding(|sim, value| sim.handle_inbound(value)))
            .await
            .map_err(HarnessError::Driver)?;

        debug!(plugin_id = %self.inner.plugin_id, "Handshake interception installed");
        Ok(())
    }

    /// Page binding that holds only a weak reference back to the channel.
    fn binding<F>(&self, f: F) -> PageBinding
    where
        F: Fn(MessageChannelSimulator, Value) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        let f = Arc::new(f);
        Arc::new(move |value| {
            let weak = weak.clone();
            let f = Arc::clone(&f);
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        f(MessageChannelSimulator { inner }, value).await?;
                    }
                    None => debug!("Binding called after the channel was dropped"),
                }
                Ok(Value::Null)
            }
            .boxed()
        })
    }

    fn handle_hello(&self, value: Value) -> BoxFuture<'static, anyhow::Result<()>> {
        let sim = self.clone();
        async move {
            match serde_json::from_value::<HandshakeSignal>(value) {
                Ok(HandshakeSignal::Hello { plugin_id }) if plugin_id == sim.inner.plugin_id => {
                    sim.open().await?;
                }
                Ok(HandshakeSignal::Hello { plugin_id }) => {
                    warn!(
                        expected = %sim.inner.plugin_id,
                        received = %plugin_id,
                        "Ignoring hello from a different plugin"
                    );
                }
                Ok(HandshakeSignal::Ack) => debug!("Plugin acknowledged init"),
                Err(e) => warn!(error = %e, "Ignoring malformed handshake signal"),
            }
            Ok(())
        }
        .boxed()
    }

    /// Open the channel and flush queued messages in order.
    async fn open(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.phase == ChannelPhase::Ready || state.opening {
                debug!(plugin_id = %self.inner.plugin_id, "Duplicate hello ignored");
                return Ok(());
            }
            state.opening = true;
        }

        let arg = open_channel_arg(&self.inner.session.read())?;
        if let Err(e) = self.inner.page.evaluate(OPEN_CHANNEL_SCRIPT, arg).await {
            self.inner.state.lock().opening = false;
            return Err(HarnessError::Driver(e));
        }
        info!(plugin_id = %self.inner.plugin_id, "Plugin handshake completed");

        loop {
            let next = {
                let mut state = self.inner.state.lock();
                match state.pending.pop_front() {
                    Some(envelope) => envelope,
                    None => {
                        state.phase = ChannelPhase::Ready;
                        state.opening = false;
                        break;
                    }
                }
            };
            if let Err(e) = self.post(&next).await {
                let mut state = self.inner.state.lock();
                state.pending.push_front(next);
                state.opening = false;
                return Err(e);
            }
        }

        self.inner.ready.send_replace(true);
        Ok(())
    }

    /// Send `data` on `topic` as the host.
    pub async fn emit(&self, topic: impl Into<String>, data: Value) -> Result<()> {
        self.emit_message(EventBusMessage::new(topic, data, HOST_SENDER)).await
    }

    /// Send `data` on `topic` with a custom sender tag.
    pub async fn emit_from(
        &self,
        topic: impl Into<String>,
        data: Value,
        sender: impl Into<String>,
    ) -> Result<()> {
        self.emit_message(EventBusMessage::new(topic, data, sender)).await
    }

    /// Deliver `event` now, or queue it until the channel opens.
    pub async fn emit_message(&self, event: EventBusMessage) -> Result<()> {
        let envelope = ChannelEnvelope::Event { event };
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                ChannelPhase::Detached => {
                    return Err(HarnessError::ChannelNotInitialized { operation: "emit" })
                }
                ChannelPhase::AwaitingHandshake => {
                    if let Some(event) = envelope.event() {
                        debug!(topic = %event.topic, "Queueing event until handshake");
                    }
                    state.pending.push_back(envelope);
                    return Ok(());
                }
                ChannelPhase::Ready => {}
            }
        }
        self.post(&envelope).await
    }

    async fn post(&self, envelope: &ChannelEnvelope) -> Result<()> {
        let arg = serde_json::to_value(envelope)?;
        self.inner
            .page
            .evaluate(POST_TO_PLUGIN_SCRIPT, arg)
            .await
            .map_err(HarnessError::Driver)?;
        Ok(())
    }

    /// Listen for plugin events on `topic`.
    ///
    /// Listeners for one topic run in registration order, one at a time.
    pub fn on<F, Fut>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(EventBusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Arc<ListenerFn> = Arc::new(move |event| handler(event).boxed());
        self.inner
            .listeners
            .lock()
            .entry(topic.clone())
            .or_default()
            .push((id, handler));
        Subscription {
            topic,
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Answer every request on `topic`.
    ///
    /// Replaces whatever responder the topic had before.
    pub fn respond(&self, topic: impl Into<String>, reply: impl Into<Reply>) -> ResponderHandle {
        self.insert_responder(topic.into(), reply.into(), false)
    }

    /// Answer the next request on `topic`, then unregister.
    pub fn respond_once(&self, topic: impl Into<String>, reply: impl Into<Reply>) -> ResponderHandle {
        self.insert_responder(topic.into(), reply.into(), true)
    }

    fn insert_responder(&self, topic: String, reply: Reply, once: bool) -> ResponderHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .responders
            .lock()
            .insert(topic.clone(), Responder { id, once, reply });
        if previous.is_some() {
            debug!(topic = %topic, "Replacing existing responder");
        }
        ResponderHandle {
            topic,
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn has_responder(&self, topic: &str) -> bool {
        self.inner.responders.lock().contains_key(topic)
    }

    fn handle_inbound(&self, value: Value) -> BoxFuture<'static, anyhow::Result<()>> {
        let sim = self.clone();
        async move {
            match classify_inbound(value) {
                Inbound::Event(event) => sim.dispatch(event).await,
                Inbound::Malformed(reason) => {
                    warn!(reason = %reason, "Dropping malformed plugin event");
                    Ok(())
                }
                Inbound::Other(value) => {
                    debug!(message = %value, "Ignoring non-event channel message");
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// Run listeners for `event`, then answer it if it is a request.
    async fn dispatch(&self, event: EventBusMessage) -> anyhow::Result<()> {
        let listeners: Vec<Arc<ListenerFn>> = self
            .inner
            .listeners
            .lock()
            .get(&event.topic)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        if listeners.is_empty() && !self.has_responder(&event.topic) {
            warn!(topic = %event.topic, sender = %event.sender, "No listeners for plugin event");
        }

        for listener in listeners {
            listener(event.clone()).await?;
        }

        let Some(event_id) = event.event_id.clone() else {
            return Ok(());
        };

        let reply = {
            let mut responders = self.inner.responders.lock();
            match responders.get(&event.topic) {
                Some(r) if r.once => responders.remove(&event.topic).map(|r| r.reply),
                Some(r) => Some(r.reply.clone()),
                None => None,
            }
        };
        let Some(reply) = reply else {
            debug!(topic = %event.topic, event_id = %event_id, "No responder for request");
            return Ok(());
        };

        let topic = event.topic.clone();
        let data = match reply.produce(event).await {
            Ok(data) => data,
            Err(e) => {
                warn!(topic = %topic, event_id = %event_id, error = %e, "Responder failed, sending no response");
                return Ok(());
            }
        };

        debug!(topic = %topic, event_id = %event_id, "Answering plugin request");
        let envelope = ChannelEnvelope::Response {
            response: EventResponse {
                event_id,
                topic,
                data,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        };
        self.post(&envelope).await?;
        Ok(())
    }

    /// Resolves once the handshake has completed.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Wait for the next plugin event on `topic`.
    pub async fn wait_for_event(
        &self,
        topic: impl Into<String>,
        timeout: Duration,
    ) -> Result<EventBusMessage> {
        let topic = topic.into();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.on(topic.clone(), move |event| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event);
            }
            async { anyhow::Ok(()) }
        });

        let received = tokio::time::timeout(timeout, rx).await;
        subscription.unsubscribe();
        match received {
            Ok(Ok(event)) => Ok(event),
            _ => Err(HarnessError::EventTimeout {
                topic,
                timeout_ms: duration_ms(timeout),
            }),
        }
    }

    /// Drop every listener, responder and queued message.
    ///
    /// The built-in credential and profile responders are registered again.
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
        self.inner.responders.lock().clear();
        self.inner.state.lock().pending.clear();
        self.register_builtin_responders();
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Removes one listener registered with [`MessageChannelSimulator::on`].
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    inner: Weak<ChannelInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns false when the listener was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut listeners = inner.listeners.lock();
        let Some(list) = listeners.get_mut(&self.topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&self.topic);
        }
        removed
    }
}

/// Removes one responder registration.
#[derive(Debug)]
pub struct ResponderHandle {
    topic: String,
    id: u64,
    inner: Weak<ChannelInner>,
}

impl ResponderHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the responder unless it was consumed or replaced since.
    pub fn remove(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut responders = inner.responders.lock();
        match responders.get(&self.topic) {
            Some(r) if r.id == self.id => {
                responders.remove(&self.topic);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ChannelInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInner")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::testing::FakePage;
    use std::sync::atomic::AtomicUsize;

    fn simulator() -> (Arc<FakePage>, MessageChannelSimulator) {
        let page = Arc::new(FakePage::new());
        let init = InitPayload::from_config(&HarnessConfig::default());
        let sim = MessageChannelSimulator::new(page.clone(), init);
        (page, sim)
    }

    fn request(topic: &str, event_id: &str) -> Value {
        json!({"event": {
            "timestamp": 1,
            "sender": "plugin123",
            "topic": topic,
            "data": {},
            "eventId": event_id,
        }})
    }

    #[tokio::test]
    async fn test_emit_before_install_fails() {
        let (_page, sim) = simulator();
        let err = sim.emit("plugin123.x", json!(1)).await.unwrap_err();
        assert!(matches!(err, HarnessError::ChannelNotInitialized { operation: "emit" }));
    }

    #[tokio::test]
    async fn test_install_injects_script_and_bindings() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        sim.install().await.unwrap();

        assert_eq!(sim.phase(), ChannelPhase::AwaitingHandshake);
        assert_eq!(page.init_scripts().len(), 1);
        assert!(page.has_binding(HELLO_BINDING));
        assert!(page.has_binding(INBOUND_BINDING));
    }

    #[tokio::test]
    async fn test_queued_events_flush_in_order() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();

        sim.emit("t.one", json!(1)).await.unwrap();
        sim.emit("t.two", json!(2)).await.unwrap();
        sim.emit("t.three", json!(3)).await.unwrap();
        assert_eq!(sim.pending_len(), 3);
        assert!(page.delivered().is_empty());

        page.plugin_hello("plugin123").await.unwrap();
        assert_eq!(sim.phase(), ChannelPhase::Ready);
        assert_eq!(sim.pending_len(), 0);

        sim.emit("t.four", json!(4)).await.unwrap();
        let topics: Vec<String> = page
            .delivered()
            .iter()
            .filter_map(|e| e.event().map(|ev| ev.topic.clone()))
            .collect();
        assert_eq!(topics, vec!["t.one", "t.two", "t.three", "t.four"]);
    }

    #[tokio::test]
    async fn test_hello_from_other_plugin_ignored() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();

        page.plugin_hello("someone-else").await.unwrap();
        assert_eq!(sim.phase(), ChannelPhase::AwaitingHandshake);
        assert!(page.init_payload().is_none());

        page.plugin_hello("plugin123").await.unwrap();
        assert_eq!(sim.phase(), ChannelPhase::Ready);
        assert_eq!(page.init_payload().unwrap()["pluginId"], "plugin123");
    }

    #[tokio::test]
    async fn test_duplicate_hello_opens_once() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();
        assert_eq!(page.channels_opened(), 1);
    }

    #[tokio::test]
    async fn test_ack_is_ignored() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.call_binding(HELLO_BINDING, json!({"type": "plugin:ack"}))
            .await
            .unwrap();
        assert_eq!(sim.phase(), ChannelPhase::AwaitingHandshake);
    }

    #[tokio::test]
    async fn test_respond_once_fires_once() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        let handle = sim.respond_once("plugin123.action.requestMain", json!({"action": "open"}));
        page.plugin_send(request("plugin123.action.requestMain", "e1")).await.unwrap();
        page.plugin_send(request("plugin123.action.requestMain", "e2")).await.unwrap();

        let responses: Vec<EventResponse> = page
            .delivered()
            .iter()
            .filter_map(|e| e.response().cloned())
            .collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].event_id, "e1");
        assert_eq!(responses[0].data, json!({"action": "open"}));
        assert!(!handle.remove());
    }

    #[tokio::test]
    async fn test_respond_persists_until_removed() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        let handle = sim.respond(
            "plugin123.data.lookup",
            Reply::from_fn(|event| Ok(json!({"echo": event.event_id}))),
        );
        page.plugin_send(request("plugin123.data.lookup", "a")).await.unwrap();
        page.plugin_send(request("plugin123.data.lookup", "b")).await.unwrap();
        assert!(handle.remove());
        page.plugin_send(request("plugin123.data.lookup", "c")).await.unwrap();

        let echoes: Vec<Value> = page
            .delivered()
            .iter()
            .filter_map(|e| e.response().map(|r| r.data["echo"].clone()))
            .collect();
        assert_eq!(echoes, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_later_respond_replaces_earlier() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        let first = sim.respond("t.req", json!("first"));
        let _second = sim.respond("t.req", json!("second"));
        page.plugin_send(request("t.req", "x")).await.unwrap();

        let responses: Vec<Value> = page
            .delivered()
            .iter()
            .filter_map(|e| e.response().map(|r| r.data.clone()))
            .collect();
        assert_eq!(responses, vec![json!("second")]);
        // A replaced handle no longer owns the topic.
        assert!(!first.remove());
        assert!(sim.has_responder("t.req"));
    }

    #[tokio::test]
    async fn test_failing_responder_sends_nothing() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        sim.respond("t.req", Reply::from_fn(|_| anyhow::bail!("boom")));
        page.plugin_send(request("t.req", "x")).await.unwrap();
        assert!(page.delivered().iter().all(|e| e.response().is_none()));
    }

    #[tokio::test]
    async fn test_listeners_run_in_order_and_errors_propagate() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        sim.on("t.evt", move |_| {
            let o1 = o1.clone();
            async move {
                tokio::task::yield_now().await;
                o1.lock().push(1);
                anyhow::Ok(())
            }
        });
        let o2 = order.clone();
        sim.on("t.evt", move |_| {
            o2.lock().push(2);
            async { Err::<(), _>(anyhow::anyhow!("plugin sent garbage")) }
        });

        let event = json!({"event": {"timestamp": 1, "sender": "p", "topic": "t.evt", "data": null}});
        let result = page.plugin_send(event).await;
        assert!(result.is_err());
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_listener() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let sub = sim.on("t.evt", move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(()) }
        });
        let h2 = hits.clone();
        sim.on("t.evt", move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
            async { anyhow::Ok(()) }
        });

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        let event = json!({"event": {"timestamp": 1, "sender": "p", "topic": "t.evt", "data": null}});
        page.plugin_send(event).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_builtin_responders_use_current_session() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();

        sim.set_access_token("rotated", 42);
        page.plugin_send(request(ACCESS_TOKEN_TOPIC, "tok")).await.unwrap();

        let mut profile = ProfileFixture::default();
        profile.target_language = "fr".to_string();
        sim.set_profile(profile);
        page.plugin_send(request(PROFILE_TOPIC, "prof")).await.unwrap();

        let responses: Vec<EventResponse> = page
            .delivered()
            .iter()
            .filter_map(|e| e.response().cloned())
            .collect();
        assert_eq!(responses[0].data, json!({"accessToken": "rotated", "expiresAt": 42}));
        assert_eq!(responses[1].data["targetLanguage"], "fr");
    }

    #[tokio::test]
    async fn test_wait_for_event() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();
        sim.wait_until_ready().await;

        // join! polls the waiter first, so its listener exists before the send.
        let event = json!({"event": {"timestamp": 1, "sender": "p", "topic": "t.done", "data": 7}});
        let (received, sent) = tokio::join!(
            sim.wait_for_event("t.done", Duration::from_secs(5)),
            page.plugin_send(event),
        );
        sent.unwrap();
        assert_eq!(received.unwrap().data, json!(7));
    }

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(duration_ms(Duration::from_millis(50)), 50);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_clear_keeps_builtin_responders() {
        let (page, sim) = simulator();
        sim.install().await.unwrap();
        page.plugin_hello("plugin123").await.unwrap();
        sim.respond("t.req", json!(1));

        sim.clear();
        assert!(!sim.has_responder("t.req"));
        assert!(sim.has_responder(ACCESS_TOKEN_TOPIC));
        assert!(sim.has_responder(PROFILE_TOPIC));

        page.plugin_send(request(ACCESS_TOKEN_TOPIC, "after-clear")).await.unwrap();
        let answered: Vec<EventResponse> = page
            .delivered()
            .iter()
            .filter_map(|e| e.response().cloned())
            .collect();
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].event_id, "after-clear");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_event_times_out() {
        let (_page, sim) = simulator();
        let err = sim
            .wait_for_event("t.never", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::EventTimeout { timeout_ms: 50, .. }));
    }
}
