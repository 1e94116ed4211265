//! Plugin API.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::PluginKind;

/// Plugin errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Plugin process could not be launched.
    #[error("Spawn failed: {0}")]
    Spawn(String),

    /// Plugin did not signal readiness in time.
    #[error("Handshake timed out after {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    /// A single call exceeded its deadline.
    #[error("Request '{action}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Action that timed out.
        action: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Plugin process terminated.
    #[error("Plugin process exited (code: {code:?})")]
    ProcessExited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// Plugin answered with `success: false`.
    #[error("Plugin error: {0}")]
    Remote(String),

    /// Call attempted before the handshake or after stop.
    #[error("Plugin not ready: {0}")]
    NotReady(String),

    /// Plugin not found.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Call cancelled because the bridge was stopped.
    #[error("Plugin stopped")]
    Stopped,

    /// Bridge used out of order (e.g. started twice).
    #[error("Invalid bridge state: {0}")]
    InvalidState(String),

    /// Plugin kind has no loader yet.
    #[error("Plugin kind '{0}' is not supported")]
    UnsupportedKind(PluginKind),

    /// Too many calls in flight.
    #[error("Too many pending requests (limit {limit})")]
    Backpressure {
        /// Configured limit.
        limit: usize,
    },

    /// Manifest is not well formed.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Writing to the plugin failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Lifecycle status of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Launched, waiting for the handshake.
    Loading,
    /// Accepting requests.
    Ready,
    /// Failed or exited unexpectedly.
    Error,
    /// Stopped by the host.
    Stopped,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
