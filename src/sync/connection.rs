//! Channel lifecycle: connect, heartbeat, classify inbound frames, reconnect.
//!
//! One [`ConnectionManager`] owns at most one WebSocket channel. Inbound
//! frames are processed one at a time by the channel's reader task; outbound
//! frames go through an unbounded queue drained by a writer task. Every
//! channel carries a generation number so that close events and scheduled
//! restarts belonging to a superseded channel are ignored.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::events::{EventBus, CONNECTION_CHANGED};
use super::router::{invoke_guarded, MessageRouter};
use crate::config::RtuConfig;
use crate::protocol::{
    builtin, InboundFrame, MessageEnvelope, OutboundRequest, ProtocolError, ProtocolErrorKind,
    TypeTagCache, PING_FRAME, PONG_FRAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never started
    Idle,
    Initializing,
    /// Channel open and ready for writes
    Open,
    Closing,
    Closed,
    Error,
    Reconnecting,
    /// Stopped after the server rejected our credentials
    SecurityClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Connecting in the background; readiness is reported later
    Started,
    /// A channel already exists
    AlreadyRunning,
    /// The base URL has no channel equivalent
    Unsupported,
}

/// What the manager did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Heartbeat answered
    Heartbeat,
    /// Liveness probe logged
    Liveness,
    /// Status refresh requested; value is the number of scheduler callbacks
    OnlineStatus(usize),
    /// Handed to the router; value is the number of callbacks invoked
    Dispatched(usize),
    /// `Error` frame
    ProtocolError(ProtocolErrorKind),
    /// Not a typed JSON envelope
    Malformed,
}

type OpenHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;
type CloseHook = Arc<dyn Fn(Option<u16>) -> Result<()> + Send + Sync>;
type TextHook = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Consumer callbacks on channel edges. Each is optional; failures are
/// logged and never interrupt frame processing.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    on_open: Option<OpenHook>,
    on_close: Option<CloseHook>,
    on_error: Option<TextHook>,
    on_message: Option<TextHook>,
}

impl ConnectionHooks {
    pub fn on_open(mut self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    pub fn on_close(
        mut self,
        hook: impl Fn(Option<u16>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_message(mut self, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(hook));
        self
    }
}

struct ChannelHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

struct Inner {
    config: RtuConfig,
    router: MessageRouter,
    bus: EventBus,
    tags: TypeTagCache,
    hooks: RwLock<ConnectionHooks>,
    /// Present while the manager is supposed to be connected
    endpoint: Mutex<Option<Url>>,
    channel: Mutex<Option<ChannelHandle>>,
    generation: AtomicU64,
    failures: AtomicU32,
    restarts_scheduled: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owner of the channel. Cheap to clone; clones share the same channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: RtuConfig, router: MessageRouter, bus: EventBus) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                router,
                bus,
                tags: TypeTagCache::new(),
                hooks: RwLock::new(ConnectionHooks::default()),
                endpoint: Mutex::new(None),
                channel: Mutex::new(None),
                generation: AtomicU64::new(0),
                failures: AtomicU32::new(0),
                restarts_scheduled: AtomicU64::new(0),
                state_tx,
            }),
        }
    }

    pub fn set_hooks(&self, hooks: ConnectionHooks) {
        *self.inner.hooks.write() = hooks;
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the channel is open. Returns `false` on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Open)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Number of restarts scheduled since creation.
    pub fn restarts_scheduled(&self) -> u64 {
        self.inner.restarts_scheduled.load(Ordering::SeqCst)
    }

    /// Open the channel in the background.
    pub fn start(&self, is_restart: bool) -> StartOutcome {
        let mut channel = self.inner.channel.lock();
        if channel.is_some() {
            return StartOutcome::AlreadyRunning;
        }
        let Some(endpoint) = self.inner.config.endpoint_uri() else {
            tracing::warn!(
                base = %self.inner.config.base_url,
                "channel transport not supported for this base url"
            );
            return StartOutcome::Unsupported;
        };

        *self.inner.endpoint.lock() = Some(endpoint.clone());
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let changed = self.replace_state(ConnectionState::Initializing);
        tracing::info!(
            host = endpoint.host_str().unwrap_or_default(),
            path = endpoint.path(),
            generation,
            restart = is_restart,
            "opening channel"
        );

        let (outbound, queue) = mpsc::unbounded_channel();
        let reader = tokio::spawn(run_channel(self.clone(), generation, endpoint, queue));
        *channel = Some(ChannelHandle {
            generation,
            outbound,
            reader,
        });
        drop(channel);

        // Announced outside the channel lock; bus handlers may send frames
        if changed {
            self.announce_state(ConnectionState::Initializing);
        }
        StartOutcome::Started
    }

    /// Tear down the current channel and start a fresh one after `delay`.
    /// The scheduled start is skipped if the manager was stopped or another
    /// channel generation took over in the meantime.
    pub fn restart(&self, reason: &str, delay: Duration) {
        if self.inner.endpoint.lock().is_none() {
            tracing::debug!(reason, "restart ignored, manager stopped");
            return;
        }
        self.teardown(true);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.restarts_scheduled.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Reconnecting);
        tracing::info!(reason, delay_ms = delay.as_millis() as u64, "scheduling channel restart");

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.inner.endpoint.lock().is_none() {
                tracing::debug!("restart cancelled, manager stopped");
                return;
            }
            if !manager.is_current(generation) {
                tracing::debug!(generation, "restart superseded");
                return;
            }
            manager.start(true);
        });
    }

    /// Close the channel and suppress any pending restart.
    pub fn stop(&self) {
        self.shutdown(ConnectionState::Closed);
    }

    /// Queue a text frame. Returns `false` when there is no channel.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let text: String = text.into();
        let channel = self.inner.channel.lock();
        match channel.as_ref() {
            Some(handle) => handle.outbound.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Classify one inbound frame and act on it.
    pub fn handle_frame(&self, text: &str) -> FrameOutcome {
        let on_message = self.inner.hooks.read().on_message.clone();
        if let Some(hook) = on_message {
            invoke_guarded("on_message", || hook(text));
        }

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed frame");
                return FrameOutcome::Malformed;
            }
        };

        if frame.is_error() {
            let error = ProtocolError::from_payload(&frame.data);
            if !error.is_fatal() {
                tracing::warn!(%error, "server reported an error");
                return FrameOutcome::ProtocolError(error.kind);
            }
            if error.kind == ProtocolErrorKind::Authorization {
                tracing::error!(%error, "authorization rejected, stopping channel");
                self.shutdown(ConnectionState::SecurityClosed);
            } else {
                tracing::error!(%error, "server rejected a request, stopping channel");
                self.shutdown(ConnectionState::Closed);
            }
            return FrameOutcome::ProtocolError(error.kind);
        }

        let tag = self.inner.tags.resolve(&frame.kind);
        match tag.service_name.as_str() {
            builtin::PONG => {
                self.send_text(PING_FRAME);
                FrameOutcome::Heartbeat
            }
            builtin::PING => {
                self.send_text(PONG_FRAME);
                FrameOutcome::Heartbeat
            }
            builtin::ALIVE => {
                tracing::debug!(payload = %frame.data, "liveness probe");
                FrameOutcome::Liveness
            }
            builtin::ONLINE_STATUS => {
                match OutboundRequest::get("Status", "Online").to_frame() {
                    Ok(request) => {
                        self.send_text(request);
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to build status refresh"),
                }
                let scheduler = MessageEnvelope::new(
                    builtin::SCHEDULER,
                    tag.object_name.clone(),
                    tag.event_name.clone(),
                    frame.data,
                );
                FrameOutcome::OnlineStatus(self.inner.router.dispatch(&scheduler))
            }
            _ => {
                let envelope = MessageEnvelope::from_tag(tag.clone(), frame.data);
                FrameOutcome::Dispatched(self.inner.router.dispatch(&envelope))
            }
        }
    }

    /// Install an open channel whose outbound queue the caller reads.
    #[cfg(test)]
    pub(crate) fn install_test_channel(&self) -> mpsc::UnboundedReceiver<Message> {
        let (outbound, queue) = mpsc::unbounded_channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.endpoint.lock() = self.inner.config.endpoint_uri();
        *self.inner.channel.lock() = Some(ChannelHandle {
            generation,
            outbound,
            reader: tokio::spawn(async {}),
        });
        self.set_state(ConnectionState::Open);
        queue
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: ConnectionState) {
        if self.replace_state(state) {
            self.announce_state(state);
        }
    }

    fn replace_state(&self, state: ConnectionState) -> bool {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "connection state changed");
        }
        previous != state
    }

    fn announce_state(&self, state: ConnectionState) {
        self.inner
            .bus
            .broadcast(CONNECTION_CHANGED, json!({ "state": format!("{state:?}") }));
    }

    fn shutdown(&self, final_state: ConnectionState) {
        self.inner.endpoint.lock().take();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if self.teardown(true) {
            self.set_state(ConnectionState::Closing);
        }
        self.set_state(final_state);
    }

    /// Drop the current channel, asking the writer to send a close frame.
    fn teardown(&self, abort_reader: bool) -> bool {
        let Some(handle) = self.inner.channel.lock().take() else {
            return false;
        };
        let _ = handle.outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client shutdown".into(),
        })));
        if abort_reader {
            handle.reader.abort();
        }
        tracing::debug!(generation = handle.generation, "channel torn down");
        true
    }

    fn handle_opened(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.inner.failures.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Open);
        tracing::info!(generation, "channel open");

        let on_open = self.inner.hooks.read().on_open.clone();
        if let Some(hook) = on_open {
            invoke_guarded("on_open", || hook());
        }
        self.send_text(PING_FRAME);
    }

    fn handle_error(&self, generation: u64, message: &str) {
        if !self.is_current(generation) {
            return;
        }
        self.set_state(ConnectionState::Error);
        tracing::warn!(generation, error = message, "channel error");

        let on_error = self.inner.hooks.read().on_error.clone();
        if let Some(hook) = on_error {
            invoke_guarded("on_error", || hook(message));
        }
    }

    fn handle_closed(&self, generation: u64, code: Option<u16>) {
        if !self.is_current(generation) {
            tracing::debug!(generation, "ignoring close of superseded channel");
            return;
        }
        self.teardown(false);

        let on_close = self.inner.hooks.read().on_close.clone();
        if let Some(hook) = on_close {
            invoke_guarded("on_close", || hook(code));
        }

        if code == Some(self.inner.config.permanent_close_code) {
            tracing::info!(?code, "channel closed permanently by server");
            self.set_state(ConnectionState::Closed);
            return;
        }
        if self.inner.endpoint.lock().is_none() {
            self.set_state(ConnectionState::Closed);
            return;
        }

        let attempt = self.inner.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.inner.config.reconnect_policy().delay_for(attempt);
        self.restart(&format!("channel closed with code {code:?}"), delay);
    }
}

async fn run_channel(
    manager: ConnectionManager,
    generation: u64,
    endpoint: Url,
    mut queue: mpsc::UnboundedReceiver<Message>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(err) => {
            manager.handle_error(generation, &format!("connection failed: {err}"));
            manager.handle_closed(generation, None);
            return;
        }
    };
    if !manager.is_current(generation) {
        return;
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Writer: drains the outbound queue until the handle is dropped
    tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    manager.handle_opened(generation);

    let mut close_code = None;
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                manager.handle_frame(text.as_str());
            }
            Ok(Message::Binary(bin)) => match std::str::from_utf8(&bin) {
                Ok(text) => {
                    manager.handle_frame(text);
                }
                Err(_) => tracing::debug!(len = bin.len(), "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Err(err) => {
                manager.handle_error(generation, &err.to_string());
                break;
            }
        }
    }

    manager.handle_closed(generation, close_code);
}
