//! Plugin channels: the byte stream a bridge talks over.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

/// How long to keep draining stdout after the process has exited.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Read buffer size for plugin stdout.
const READ_CHUNK_SIZE: usize = 8192;

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Process could not be launched.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// IO error on an open channel.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel has not been spawned.
    #[error("Channel not started")]
    NotStarted,

    /// Channel is closed.
    #[error("Channel closed")]
    Closed,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes read from the plugin, in arrival order with arbitrary boundaries.
    Data(Vec<u8>),
    /// The plugin terminated. Always the last event.
    Exited(Option<i32>),
}

/// Receiving side of a spawned channel.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// A bidirectional byte channel to one plugin.
///
/// Implementations report inbound data and termination through the
/// [`ChannelEvents`] receiver returned by [`spawn`](Self::spawn).
#[async_trait]
pub trait PluginChannel: Send + Sync {
    /// Launch the plugin.
    async fn spawn(&self) -> Result<ChannelEvents, TransportError>;

    /// Write raw bytes to the plugin.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Forcibly terminate the plugin. Idempotent.
    async fn kill(&self) -> Result<(), TransportError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// How to launch a plugin executable.
///
/// Arguments and environment are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable path or name on `PATH`.
    pub program: PathBuf,
    /// Ordered arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Create a spec with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Channel backed by a child process speaking over stdin/stdout.
///
/// stderr is forwarded to `tracing` at debug level.
pub struct ProcessChannel {
    spec: LaunchSpec,
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessChannel {
    /// Create a channel for the given launch spec. Nothing runs until `spawn`.
    #[must_use]
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            stdin: Mutex::new(None),
            kill_tx: std::sync::Mutex::new(None),
        }
    }

    /// The launch spec.
    #[must_use]
    pub const fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    fn take_kill_tx(&self) -> Option<oneshot::Sender<()>> {
        self.kill_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl PluginChannel for ProcessChannel {
    async fn spawn(&self) -> Result<ChannelEvents, TransportError> {
        let program = self.spec.program.display().to_string();

        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: program.clone(),
                source,
            })?;

        tracing::info!(program = %program, pid = ?child.id(), "Spawned plugin process");

        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;

        if let Some(stderr) = child.stderr.take() {
            let program = program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(program = %program, plugin_stderr = %line);
                }
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        *self.stdin.lock().await = Some(stdin);
        *self
            .kill_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(kill_tx);

        let reader = tokio::spawn(read_stdout(stdout, events_tx.clone()));
        tokio::spawn(supervise(child, reader, kill_rx, events_tx, program));

        Ok(events_rx)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotStarted)?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn kill(&self) -> Result<(), TransportError> {
        if let Some(kill_tx) = self.take_kill_tx() {
            let _ = kill_tx.send(());
        }
        // A writer stuck on a full pipe holds the lock; it fails with a
        // broken pipe once the process is gone and stdin is dropped with
        // the channel.
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("process {}", self.spec.program.display())
    }
}

/// Forward stdout chunks until EOF.
async fn read_stdout(mut stdout: ChildStdout, events: mpsc::UnboundedSender<ChannelEvent>) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events.send(ChannelEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Plugin stdout read failed");
                break;
            }
        }
    }
}

/// Wait for the child to exit (or be killed) and report it after stdout drains.
///
/// Dropping the kill sender counts as a kill request.
async fn supervise(
    mut child: Child,
    reader: tokio::task::JoinHandle<()>,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    program: String,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            tracing::info!(program = %program, "Killing plugin process");
            if let Err(e) = child.start_kill() {
                tracing::warn!(program = %program, error = %e, "Failed to kill plugin process");
            }
            child.wait().await
        }
    };

    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
        tracing::debug!(program = %program, "Plugin stdout still open after exit");
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "Failed to reap plugin process");
            None
        }
    };

    tracing::info!(program = %program, ?code, "Plugin process exited");
    let _ = events.send(ChannelEvent::Exited(code));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("diamond")
            .arg("--plugin-mode")
            .env("PLUGIN_AUTH_TOKEN", "abc");
        assert_eq!(spec.args, vec!["--plugin-mode".to_string()]);
        assert_eq!(spec.env.get("PLUGIN_AUTH_TOKEN").map(String::as_str), Some("abc"));
        assert!(spec.cwd.is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let channel = ProcessChannel::new(LaunchSpec::new("/nonexistent/mdreader-plugin-xyz"));
        let result = channel.spawn().await;
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_write_before_spawn() {
        let channel = ProcessChannel::new(LaunchSpec::new("true"));
        let result = channel.write(b"hello\n").await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn test_kill_before_spawn_is_noop() {
        let channel = ProcessChannel::new(LaunchSpec::new("true"));
        assert!(channel.kill().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_output_and_exit() {
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("printf 'hello\\n'; exit 3");
        let channel = ProcessChannel::new(spec);
        let mut events = channel.spawn().await.unwrap();

        let mut data = Vec::new();
        let mut code = None;
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(chunk) => data.extend(chunk),
                ChannelEvent::Exited(c) => {
                    code = c;
                    break;
                }
            }
        }

        assert_eq!(data, b"hello\n");
        assert_eq!(code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_running_process() {
        let channel = ProcessChannel::new(LaunchSpec::new("sh").arg("-c").arg("sleep 30"));
        let mut events = channel.spawn().await.unwrap();
        channel.kill().await.unwrap();

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ChannelEvent::Exited(code) = event {
                    return Some(code);
                }
            }
            None
        })
        .await
        .unwrap();

        // Killed by signal, so no exit code.
        assert_eq!(exited, Some(None));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_while_write_is_blocked() {
        let channel = std::sync::Arc::new(ProcessChannel::new(
            LaunchSpec::new("sh").arg("-c").arg("exec sleep 30"),
        ));
        let mut events = channel.spawn().await.unwrap();

        // Far larger than a pipe buffer, and nobody reads it.
        let writer = {
            let channel = std::sync::Arc::clone(&channel);
            tokio::spawn(async move { channel.write(&vec![b'x'; 4 * 1024 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(1), channel.kill())
            .await
            .unwrap()
            .unwrap();

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ChannelEvent::Exited(code) = event {
                    return Some(code);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(exited, Some(None));

        let written = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(written.is_err());
    }
}
