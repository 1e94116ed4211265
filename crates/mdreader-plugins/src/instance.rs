//! Loaded plugin instances.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::api::{PluginError, PluginStatus};
use crate::bridge::{BridgePhase, PluginBridge};
use crate::manifest::{PluginKind, PluginManifest};

/// What actually runs a plugin.
pub enum InstanceBackend {
    /// Out-of-process plugin behind a bridge.
    Bridge(PluginBridge),
    /// Kind recognized but not runnable yet.
    NotImplemented(PluginKind),
}

/// Shared, mutable instance status.
pub(crate) type SharedStatus = Arc<RwLock<PluginStatus>>;

pub(crate) fn write_status(status: &SharedStatus, value: PluginStatus) {
    *status.write().unwrap_or_else(PoisonError::into_inner) = value;
}

/// A plugin the loader has loaded.
///
/// `send` and `stop` are the only operations the rest of the host should
/// need.
pub struct PluginInstance {
    id: String,
    manifest: Arc<PluginManifest>,
    status: SharedStatus,
    backend: InstanceBackend,
    enabled: bool,
    settings: Value,
}

impl PluginInstance {
    pub(crate) fn new(
        manifest: Arc<PluginManifest>,
        status: SharedStatus,
        backend: InstanceBackend,
        enabled: bool,
        settings: Value,
    ) -> Self {
        Self {
            id: manifest.id.clone(),
            manifest,
            status,
            backend,
            enabled,
            settings,
        }
    }

    /// Plugin ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The manifest this instance was loaded from.
    #[must_use]
    pub fn manifest(&self) -> &Arc<PluginManifest> {
        &self.manifest
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PluginStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: PluginStatus) {
        write_status(&self.status, status);
    }

    /// Whether the host had this plugin enabled at load time.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Settings the host supplied at load time.
    #[must_use]
    pub const fn settings(&self) -> &Value {
        &self.settings
    }

    /// The bridge, for native plugins.
    #[must_use]
    pub const fn bridge(&self) -> Option<&PluginBridge> {
        match &self.backend {
            InstanceBackend::Bridge(bridge) => Some(bridge),
            InstanceBackend::NotImplemented(_) => None,
        }
    }

    /// Call an action on the plugin.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedKind` for kinds without a runtime, otherwise
    /// whatever the bridge returns.
    pub async fn send(
        &self,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PluginError> {
        match &self.backend {
            InstanceBackend::Bridge(bridge) => bridge.send(action, payload, timeout).await,
            InstanceBackend::NotImplemented(kind) => Err(PluginError::UnsupportedKind(*kind)),
        }
    }

    /// Stop the plugin. Does not wait for the process to terminate.
    pub fn stop(&self) {
        if let InstanceBackend::Bridge(bridge) = &self.backend {
            bridge.stop();
        }
        self.set_status(PluginStatus::Stopped);
    }

    /// Wait until the plugin process has terminated.
    pub async fn wait_terminated(&self) {
        if let InstanceBackend::Bridge(bridge) = &self.backend {
            bridge.wait_terminated().await;
        }
    }

    /// Whether loading this plugin again should replace the instance.
    ///
    /// True once a native plugin has been stopped or its process has
    /// exited on its own. A bridge never restarts, so either way the next
    /// load needs a fresh instance.
    #[must_use]
    pub fn is_reloadable(&self) -> bool {
        self.bridge().is_some_and(|bridge| {
            matches!(bridge.phase(), BridgePhase::Stopped | BridgePhase::Exited)
        })
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("kind", &self.manifest.kind)
            .field("status", &self.status())
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
