//! In-process stand-in for a plugin executable.
//!
//! [`SimulatedChannel`] answers requests from a small table of canned
//! responses and emits them as ordinary wire lines, so everything above the
//! channel (framing, correlation, timeouts) runs exactly as it does against
//! a real process. Only the latency differs.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::framing::LineFramer;
use crate::messages::{PluginRequest, PluginResponse, SHUTDOWN_ACTION};
use crate::transport::{ChannelEvent, ChannelEvents, PluginChannel, TransportError};

/// Delay before a simulated response is delivered.
pub const SIMULATED_LATENCY: Duration = Duration::from_millis(50);

/// Actions the simulated plugin understands.
pub const SIMULATED_ACTIONS: &[&str] = &[
    "ping",
    "get_capabilities",
    "browse",
    "analyze",
    "report",
    "set_theme",
    "shutdown",
];

#[derive(Default)]
struct SimState {
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    framer: LineFramer,
    exited: bool,
}

/// Channel that answers from a canned action table without spawning anything.
pub struct SimulatedChannel {
    state: Arc<Mutex<SimState>>,
    latency: Duration,
}

impl SimulatedChannel {
    /// Create a simulated channel with the default latency.
    #[must_use]
    pub fn new() -> Self {
        Self::with_latency(SIMULATED_LATENCY)
    }

    /// Create a simulated channel with a custom latency.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            latency,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginChannel for SimulatedChannel {
    async fn spawn(&self) -> Result<ChannelEvents, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let capabilities: Vec<String> = SIMULATED_ACTIONS.iter().map(ToString::to_string).collect();
        let ready = PluginResponse::ready("simulated", &capabilities)
            .to_line()
            .map_err(|e| TransportError::Io(e.into()))?;
        let _ = tx.send(ChannelEvent::Data(ready.into_bytes()));

        let mut state = self.lock();
        state.events = Some(tx);
        state.framer.clear();
        state.exited = false;
        tracing::debug!("Simulated plugin channel started");
        Ok(rx)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let (lines, events) = {
            let mut state = self.lock();
            if state.exited {
                return Err(TransportError::Closed);
            }
            let events = state.events.clone().ok_or(TransportError::NotStarted)?;
            (state.framer.push(bytes), events)
        };

        for line in lines {
            let request: PluginRequest = match serde_json::from_slice(&line) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "Simulated plugin ignoring invalid request");
                    continue;
                }
            };

            let shutdown = request.action == SHUTDOWN_ACTION;
            let response = match simulated_response(&request.action, &request.payload) {
                Ok(data) => PluginResponse::success(&request.id, data),
                Err(error) => PluginResponse::error(&request.id, error),
            };
            let line = match response.to_line() {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Simulated plugin failed to encode response");
                    continue;
                }
            };

            let events = events.clone();
            let state = Arc::clone(&self.state);
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.exited {
                    return;
                }
                let _ = events.send(ChannelEvent::Data(line.into_bytes()));
                if shutdown {
                    state.exited = true;
                    state.events = None;
                    let _ = events.send(ChannelEvent::Exited(Some(0)));
                }
            });
        }

        Ok(())
    }

    async fn kill(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.exited {
            state.exited = true;
            if let Some(events) = state.events.take() {
                let _ = events.send(ChannelEvent::Exited(None));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

/// Canned response for `action`.
///
/// # Errors
///
/// Returns the error message a real plugin would send, e.g. for unknown
/// actions or missing arguments.
pub fn simulated_response(action: &str, payload: &Value) -> Result<Value, String> {
    match action {
        "ping" => Ok(json!({ "pong": true })),
        "get_capabilities" => Ok(json!({
            "actions": SIMULATED_ACTIONS,
            "version": "simulated",
            "features": {
                "simulated": true,
                "path_validation": false
            }
        })),
        "browse" => {
            let path = payload.get("path").and_then(Value::as_str).unwrap_or(".");
            Ok(json!({ "path": path, "entries": [] }))
        }
        "analyze" => {
            let files = requested_files(payload)?;
            if files.is_empty() {
                return Err("No files provided".to_string());
            }
            let analyses: Vec<Value> = files.iter().map(|f| simulated_analysis(f)).collect();
            Ok(json!({ "files_analyzed": analyses.len(), "analyses": analyses }))
        }
        "report" => {
            let files = requested_files(payload)?;
            let analyses: Vec<Value> = files.iter().map(|f| simulated_analysis(f)).collect();
            Ok(json!({
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "files_analyzed": analyses.len(),
                "total_size": 0,
                "analyses": analyses
            }))
        }
        "set_theme" => {
            let theme = payload.get("theme").and_then(Value::as_str).unwrap_or("dark");
            Ok(json!({ "theme": theme, "applied": true }))
        }
        SHUTDOWN_ACTION => Ok(json!({ "shutdown": "acknowledged" })),
        other => Err(format!("Unknown action: {other}")),
    }
}

fn requested_files(payload: &Value) -> Result<Vec<String>, String> {
    let files = payload
        .get("files")
        .ok_or_else(|| "Missing 'files' in payload".to_string())?;
    serde_json::from_value(files.clone()).map_err(|e| format!("Invalid 'files': {e}"))
}

fn simulated_analysis(path: &str) -> Value {
    let file_type = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map_or_else(|| "unknown".to_string(), str::to_lowercase);
    json!({
        "path": path,
        "size": 0,
        "file_type": file_type,
        "is_binary": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::InboundMessage;

    async fn next_message(events: &mut ChannelEvents) -> InboundMessage {
        match events.recv().await {
            Some(ChannelEvent::Data(bytes)) => {
                InboundMessage::parse(bytes.strip_suffix(b"\n").unwrap_or(&bytes)).unwrap()
            }
            other => panic!("Expected data, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_emits_handshake() {
        let channel = SimulatedChannel::new();
        let mut events = channel.spawn().await.unwrap();
        assert!(next_message(&mut events).await.is_ready_handshake());
    }

    #[tokio::test(start_paused = true)]
    async fn test_canned_ping() {
        let channel = SimulatedChannel::new();
        let mut events = channel.spawn().await.unwrap();
        next_message(&mut events).await;

        let line = PluginRequest::new("sim-1", "ping", json!({})).to_line().unwrap();
        channel.write(line.as_bytes()).await.unwrap();

        let response = next_message(&mut events).await.into_response().unwrap();
        assert_eq!(response.id, "sim-1");
        assert_eq!(response.into_result(), Ok(json!({ "pong": true })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_acknowledges_then_exits() {
        let channel = SimulatedChannel::new();
        let mut events = channel.spawn().await.unwrap();
        next_message(&mut events).await;

        let line = PluginRequest::shutdown().to_line().unwrap();
        channel.write(line.as_bytes()).await.unwrap();

        let ack = next_message(&mut events).await;
        assert_eq!(ack.id, "shutdown");
        assert_eq!(events.recv().await, Some(ChannelEvent::Exited(Some(0))));
        assert!(matches!(
            channel.write(b"{}\n").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_kill_reports_exit_once() {
        let channel = SimulatedChannel::new();
        let mut events = channel.spawn().await.unwrap();
        next_message(&mut events).await;

        channel.kill().await.unwrap();
        channel.kill().await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Exited(None)));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_write_before_spawn() {
        let channel = SimulatedChannel::new();
        assert!(matches!(
            channel.write(b"{}\n").await,
            Err(TransportError::NotStarted)
        ));
    }

    #[test]
    fn test_unknown_action_names_action() {
        let error = simulated_response("totally-unknown", &json!({})).unwrap_err();
        assert!(error.contains("totally-unknown"));
    }

    #[test]
    fn test_analyze_requires_files() {
        assert!(simulated_response("analyze", &json!({})).is_err());
        assert!(simulated_response("analyze", &json!({ "files": [] })).is_err());

        let data = simulated_response("analyze", &json!({ "files": ["notes.MD"] })).unwrap();
        assert_eq!(data["files_analyzed"], 1);
        assert_eq!(data["analyses"][0]["file_type"], "md");
    }
}
