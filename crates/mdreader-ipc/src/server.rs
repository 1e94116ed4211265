//! Plugin-side runtime.
//!
//! A plugin executable implements [`PluginHandler`] and hands its stdio to
//! [`serve`], which sends the ready handshake, answers each request line in
//! order and returns once the host asks it to shut down or closes stdin.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::messages::{PluginRequest, PluginResponse, SHUTDOWN_ACTION};
use crate::transport::TransportError;

/// Handles requests inside a plugin process.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Version reported in the handshake.
    fn version(&self) -> String;

    /// Capabilities reported in the handshake.
    fn capabilities(&self) -> Vec<String>;

    /// Handle one request. `Err` becomes a `success: false` response.
    async fn handle(&self, request: PluginRequest, notifier: &Notifier) -> Result<Value, String>;
}

/// Sends unsolicited messages to the host.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<PluginResponse>,
}

impl Notifier {
    /// Emit an event. The host sees it as a message whose `id` is `name`.
    pub fn notify(&self, name: impl Into<String>, data: Value) {
        let _ = self.tx.send(PluginResponse::success(name, data));
    }
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The host sent the shutdown request.
    Shutdown,
    /// The host closed the input stream.
    Eof,
}

/// Run the request loop until shutdown or EOF.
///
/// # Errors
///
/// Returns error if reading input or writing output fails.
pub async fn serve<H, R, W>(handler: &H, input: R, output: W) -> Result<ServeOutcome, TransportError>
where
    H: PluginHandler + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut output = output;
    let (tx, mut notifications) = mpsc::unbounded_channel();
    let notifier = Notifier { tx };

    let ready = PluginResponse::ready(&handler.version(), &handler.capabilities());
    write_message(&mut output, &ready).await?;

    let mut lines = BufReader::new(input).lines();
    loop {
        tokio::select! {
            Some(event) = notifications.recv() => {
                write_message(&mut output, &event).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::debug!("Host closed plugin input");
                    return Ok(ServeOutcome::Eof);
                };
                if line.trim().is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<PluginRequest>(&line) {
                    Ok(request) if request.action == SHUTDOWN_ACTION => {
                        let ack = PluginResponse::success(request.id, json!({ "shutdown": "acknowledged" }));
                        write_message(&mut output, &ack).await?;
                        return Ok(ServeOutcome::Shutdown);
                    }
                    Ok(request) => {
                        let id = request.id.clone();
                        tracing::debug!(id = %id, action = %request.action, "Handling request");
                        match handler.handle(request, &notifier).await {
                            Ok(data) => PluginResponse::success(id, data),
                            Err(error) => PluginResponse::error(id, error),
                        }
                    }
                    Err(e) => PluginResponse::error("unknown", format!("Invalid message: {e}")),
                };

                // Events raised while handling go out before the response.
                while let Ok(event) = notifications.try_recv() {
                    write_message(&mut output, &event).await?;
                }
                write_message(&mut output, &response).await?;
            }
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    output: &mut W,
    message: &PluginResponse,
) -> Result<(), TransportError> {
    let line = message
        .to_line()
        .map_err(|e| TransportError::Io(e.into()))?;
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
