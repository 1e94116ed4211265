//! Request/response bridge to one plugin.
//!
//! A [`PluginBridge`] owns a single [`PluginChannel`] and layers the protocol
//! on top of it:
//!
//! 1. `start()` launches the channel and waits for the `init`/`ready`
//!    handshake. Nothing else is dispatched until it arrives.
//! 2. Inbound bytes are reassembled into lines; each line is one message.
//!    Malformed lines are logged and dropped.
//! 3. `send()` registers a pending call under a fresh correlation id and
//!    writes the request. The call settles exactly once: by its response,
//!    by its timer, or by bulk cancellation when the plugin stops or exits.
//!    Messages whose id matches no pending call go to the event hook.
//! 4. `stop()` cancels everything immediately, asks the plugin to shut down
//!    and kills it if it is still running after the grace period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mdreader_ipc::{ChannelEvent, ChannelEvents, InboundMessage, LineFramer, PluginChannel, PluginRequest};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::PluginError;

/// Callback for unsolicited plugin messages.
pub type EventHook = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback for unexpected plugin termination.
pub type ExitHook = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Bridge timing and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long `start()` waits for the ready handshake.
    pub handshake_timeout: Duration,
    /// Default deadline for `send()`.
    pub request_timeout: Duration,
    /// How long `stop()` waits before killing the plugin.
    pub shutdown_grace: Duration,
    /// Maximum calls in flight.
    pub max_pending: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
            max_pending: 1024,
        }
    }
}

/// Host callbacks invoked by the bridge.
#[derive(Clone, Default)]
pub struct BridgeHooks {
    on_event: Option<EventHook>,
    on_exit: Option<ExitHook>,
}

impl BridgeHooks {
    /// Receive messages that answer no pending call.
    #[must_use]
    pub fn on_event(mut self, hook: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(hook));
        self
    }

    /// Be told when the plugin terminates on its own while ready.
    #[must_use]
    pub fn on_exit(mut self, hook: impl Fn(Option<i32>) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Arc::new(hook));
        self
    }
}

/// Where a bridge is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// Not started.
    Idle,
    /// Launched, waiting for the ready handshake.
    Handshaking,
    /// Accepting requests.
    Ready,
    /// Stopped by the host.
    Stopped,
    /// The plugin terminated on its own.
    Exited,
}

struct PendingCall {
    action: String,
    reply: oneshot::Sender<Result<Value, PluginError>>,
    timer: Option<JoinHandle<()>>,
}

struct BridgeState {
    phase: BridgePhase,
    pending: HashMap<String, PendingCall>,
    framer: LineFramer,
    handshake: Option<oneshot::Sender<Result<(), PluginError>>>,
}

impl BridgeState {
    /// Settle and remove one call. Returns false if it was already settled.
    fn settle(&mut self, id: &str, outcome: Result<Value, PluginError>) -> bool {
        let Some(call) = self.pending.remove(id) else {
            return false;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }
        let _ = call.reply.send(outcome);
        true
    }

    /// Settle every pending call with the same error.
    fn reject_all(&mut self, error: &PluginError) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            if let Some(timer) = call.timer {
                timer.abort();
            }
            let _ = call.reply.send(Err(error.clone()));
        }
        count
    }
}

/// State shared with the pump, timer and shutdown tasks.
struct Shared {
    plugin_id: String,
    state: Mutex<BridgeState>,
    hooks: BridgeHooks,
    terminated: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one inbound chunk through framing and dispatch.
    fn ingest(&self, chunk: &[u8]) {
        let mut unsolicited = Vec::new();
        {
            let mut state = self.lock();
            for line in state.framer.push(chunk) {
                let message = match InboundMessage::parse(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(
                            plugin = %self.plugin_id,
                            error = %e,
                            line = %String::from_utf8_lossy(&line),
                            "Discarding malformed frame"
                        );
                        continue;
                    }
                };

                match state.phase {
                    BridgePhase::Handshaking => {
                        if message.is_ready_handshake() {
                            state.phase = BridgePhase::Ready;
                            if let Some(handshake) = state.handshake.take() {
                                let _ = handshake.send(Ok(()));
                            }
                        } else {
                            tracing::debug!(
                                plugin = %self.plugin_id,
                                id = %message.id,
                                "Ignoring message received before handshake"
                            );
                        }
                    }
                    BridgePhase::Ready => {
                        if state.pending.contains_key(&message.id) {
                            let id = message.id.clone();
                            let outcome = match message.into_response() {
                                Ok(response) => response.into_result().map_err(PluginError::Remote),
                                Err(e) => Err(PluginError::Remote(format!("Malformed response: {e}"))),
                            };
                            tracing::debug!(plugin = %self.plugin_id, id = %id, ok = outcome.is_ok(), "Response received");
                            state.settle(&id, outcome);
                        } else {
                            unsolicited.push(message.into_value());
                        }
                    }
                    BridgePhase::Idle | BridgePhase::Stopped | BridgePhase::Exited => {
                        tracing::debug!(
                            plugin = %self.plugin_id,
                            id = %message.id,
                            "Dropping message received while not running"
                        );
                    }
                }
            }
        }

        if let Some(hook) = &self.hooks.on_event {
            for event in unsolicited {
                hook(event);
            }
        }
    }

    /// The channel reported termination.
    fn handle_exit(&self, code: Option<i32>) {
        let (previous, rejected) = {
            let mut state = self.lock();
            let previous = state.phase;
            if previous != BridgePhase::Stopped {
                state.phase = BridgePhase::Exited;
            }
            state.framer.clear();
            let error = PluginError::ProcessExited { code };
            if let Some(handshake) = state.handshake.take() {
                let _ = handshake.send(Err(error.clone()));
            }
            (previous, state.reject_all(&error))
        };

        self.terminated.send_replace(true);

        if previous == BridgePhase::Ready {
            tracing::warn!(plugin = %self.plugin_id, ?code, rejected, "Plugin exited unexpectedly");
            if let Some(hook) = &self.hooks.on_exit {
                hook(code);
            }
        } else {
            tracing::debug!(plugin = %self.plugin_id, ?code, "Plugin terminated");
        }
    }
}

/// Consume channel events until the channel terminates.
async fn pump(shared: Arc<Shared>, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(chunk) => shared.ingest(&chunk),
            ChannelEvent::Exited(code) => {
                shared.handle_exit(code);
                return;
            }
        }
    }
    // Sender dropped without an exit notice.
    shared.handle_exit(None);
}

/// Write one line in its own task.
///
/// A plugin that stops reading stdin blocks the write, never the caller:
/// the caller waits on its reply, which the timer or `stop()` can still
/// settle. A failed write settles `id` with `Transport`.
fn spawn_write(shared: &Arc<Shared>, channel: &Arc<dyn PluginChannel>, id: String, line: String) {
    let shared = Arc::clone(shared);
    let channel = Arc::clone(channel);
    tokio::spawn(async move {
        if let Err(e) = channel.write(line.as_bytes()).await {
            let settled = shared
                .lock()
                .settle(&id, Err(PluginError::Transport(e.to_string())));
            tracing::debug!(plugin = %shared.plugin_id, id = %id, settled, error = %e, "Write to plugin failed");
        }
    });
}

/// Reject a call whose deadline passed, unless it already settled.
async fn expire(shared: Arc<Shared>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let expired = shared.lock().pending.remove(&id);
    if let Some(call) = expired {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(plugin = %shared.plugin_id, id = %id, action = %call.action, timeout_ms, "Request timed out");
        let _ = call.reply.send(Err(PluginError::RequestTimeout {
            action: call.action,
            timeout_ms,
        }));
    }
}

/// Protocol bridge to a single plugin channel.
pub struct PluginBridge {
    shared: Arc<Shared>,
    channel: Arc<dyn PluginChannel>,
    config: BridgeConfig,
    id_prefix: String,
    next_seq: AtomicU64,
}

impl PluginBridge {
    /// Create a bridge. Nothing is launched until [`start`](Self::start).
    #[must_use]
    pub fn new(
        plugin_id: impl Into<String>,
        channel: Arc<dyn PluginChannel>,
        config: BridgeConfig,
        hooks: BridgeHooks,
    ) -> Self {
        let (terminated, _) = watch::channel(true);
        let shared = Shared {
            plugin_id: plugin_id.into(),
            state: Mutex::new(BridgeState {
                phase: BridgePhase::Idle,
                pending: HashMap::new(),
                framer: LineFramer::new(),
                handshake: None,
            }),
            hooks,
            terminated,
        };

        Self {
            shared: Arc::new(shared),
            channel,
            config,
            id_prefix: hex::encode(rand::random::<[u8; 4]>()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Plugin this bridge talks to.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.shared.plugin_id
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> BridgePhase {
        self.shared.lock().phase
    }

    /// Whether the handshake completed and the bridge has not stopped.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == BridgePhase::Ready
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Launch the channel and wait for the ready handshake.
    ///
    /// Calling `start` on a ready bridge does nothing. A bridge cannot be
    /// restarted once stopped or exited.
    ///
    /// # Errors
    ///
    /// Returns `Spawn` if the channel cannot launch, `HandshakeTimeout` if
    /// the plugin does not signal readiness in time, or `ProcessExited` if
    /// it terminates first.
    pub async fn start(&self) -> Result<(), PluginError> {
        let handshake = {
            let mut state = self.shared.lock();
            match state.phase {
                BridgePhase::Ready => return Ok(()),
                BridgePhase::Idle => {}
                other => {
                    return Err(PluginError::InvalidState(format!(
                        "cannot start bridge in phase {other:?}"
                    )));
                }
            }
            let (tx, rx) = oneshot::channel();
            state.handshake = Some(tx);
            state.phase = BridgePhase::Handshaking;
            rx
        };

        let events = match self.channel.spawn().await {
            Ok(events) => events,
            Err(e) => {
                let mut state = self.shared.lock();
                state.handshake = None;
                state.phase = BridgePhase::Idle;
                tracing::warn!(plugin = %self.plugin_id(), error = %e, "Failed to launch plugin");
                return Err(PluginError::Spawn(e.to_string()));
            }
        };

        self.shared.terminated.send_replace(false);
        tracing::info!(
            plugin = %self.plugin_id(),
            channel = %self.channel.describe(),
            "Plugin launched, awaiting handshake"
        );
        tokio::spawn(pump(Arc::clone(&self.shared), events));

        match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(plugin = %self.plugin_id(), "Plugin ready");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(PluginError::ProcessExited { code: None }),
            Err(_) => {
                {
                    let mut state = self.shared.lock();
                    state.handshake = None;
                    if state.phase == BridgePhase::Handshaking {
                        state.phase = BridgePhase::Stopped;
                    }
                }
                tracing::warn!(
                    plugin = %self.plugin_id(),
                    timeout_ms = ?self.config.handshake_timeout.as_millis(),
                    "Plugin handshake timed out"
                );
                if let Err(e) = self.channel.kill().await {
                    tracing::debug!(plugin = %self.plugin_id(), error = %e, "Kill after handshake timeout failed");
                }
                Err(PluginError::HandshakeTimeout(self.config.handshake_timeout))
            }
        }
    }

    /// Call `action` and wait for its outcome.
    ///
    /// `timeout` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` immediately if the bridge is not ready, then one of
    /// `Remote`, `RequestTimeout`, `Stopped`, `ProcessExited` or `Transport`.
    pub async fn send(
        &self,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PluginError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-{seq}", self.id_prefix);
        let line = PluginRequest::new(id.clone(), action, payload).to_line()?;

        let reply = {
            let mut state = self.shared.lock();
            if state.phase != BridgePhase::Ready {
                return Err(PluginError::NotReady(self.shared.plugin_id.clone()));
            }
            if state.pending.len() >= self.config.max_pending {
                return Err(PluginError::Backpressure {
                    limit: self.config.max_pending,
                });
            }

            let (tx, rx) = oneshot::channel();
            let timer = tokio::spawn(expire(Arc::clone(&self.shared), id.clone(), timeout));
            state.pending.insert(
                id.clone(),
                PendingCall {
                    action: action.to_string(),
                    reply: tx,
                    timer: Some(timer),
                },
            );
            rx
        };

        tracing::debug!(plugin = %self.plugin_id(), id = %id, action = %action, "Sending request");
        spawn_write(&self.shared, &self.channel, id, line);

        reply.await.unwrap_or(Err(PluginError::Stopped))
    }

    /// Stop the plugin without waiting for it to terminate.
    ///
    /// Pending calls are rejected with `Stopped` before this returns. The
    /// shutdown request and the forced kill happen in the background; use
    /// [`wait_terminated`](Self::wait_terminated) to wait for them.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.shared.lock();
            let previous = state.phase;
            if previous != BridgePhase::Exited {
                state.phase = BridgePhase::Stopped;
            }
            if let Some(handshake) = state.handshake.take() {
                let _ = handshake.send(Err(PluginError::Stopped));
            }
            let rejected = state.reject_all(&PluginError::Stopped);
            if rejected > 0 {
                tracing::debug!(plugin = %self.shared.plugin_id, rejected, "Rejected pending requests on stop");
            }
            previous
        };

        if !matches!(previous, BridgePhase::Ready | BridgePhase::Handshaking) {
            return;
        }

        tracing::info!(plugin = %self.plugin_id(), "Stopping plugin");

        let channel = Arc::clone(&self.channel);
        let shared = Arc::clone(&self.shared);
        let grace = self.config.shutdown_grace;
        let mut terminated = shared.terminated.subscribe();
        match PluginRequest::shutdown().to_line() {
            Ok(line) => spawn_write(&shared, &channel, "shutdown".to_string(), line),
            Err(e) => tracing::debug!(plugin = %shared.plugin_id, error = %e, "Shutdown request not encoded"),
        }

        // The grace period runs from here, whether or not the write lands.
        tokio::spawn(async move {
            let exited = tokio::time::timeout(grace, terminated.wait_for(|done| *done))
                .await
                .is_ok();
            if !exited {
                tracing::warn!(plugin = %shared.plugin_id, "Plugin still running after grace period, killing");
                if let Err(e) = channel.kill().await {
                    tracing::debug!(plugin = %shared.plugin_id, error = %e, "Kill failed");
                }
            }
        });
    }

    /// Wait until the channel has reported termination.
    ///
    /// Returns immediately for a bridge that was never started.
    pub async fn wait_terminated(&self) {
        let mut terminated = self.shared.terminated.subscribe();
        let _ = terminated.wait_for(|done| *done).await;
    }
}
