//! Manifest-driven plugin loader.
//!
//! The loader knows which plugins exist (built-in, registered and discovered
//! manifests), turns a manifest into a running [`PluginInstance`] according
//! to its kind, and keeps the registry of live instances. `load` and
//! `unload` are idempotent. Concurrent loads of the same id queue on a
//! per-id slot and share one instance; the registry lock itself is only
//! held for lookups, so one plugin's handshake never blocks another plugin
//! or a query.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use mdreader_ipc::{PluginChannel, ProcessChannel, SimulatedChannel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

use crate::api::{PluginError, PluginStatus};
use crate::bridge::{BridgeHooks, PluginBridge};
use crate::config::{ChannelMode, LoaderConfig};
use crate::events::{EventBroadcaster, PluginEvent, PluginEventEnvelope};
use crate::instance::{InstanceBackend, PluginInstance, SharedStatus, write_status};
use crate::manifest::{PluginKind, PluginManifest, builtin_manifests, discover_manifests};
use crate::registry::InstanceRegistry;

/// Host-owned plugin preferences. The loader reads them, never persists them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginPreferences {
    /// Plugins the host wants loaded.
    #[serde(default)]
    pub enabled: BTreeSet<String>,
    /// Settings blob per plugin.
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

impl PluginPreferences {
    /// Mark a plugin as enabled.
    #[must_use]
    pub fn enable(mut self, id: impl Into<String>) -> Self {
        self.enabled.insert(id.into());
        self
    }

    /// Attach settings for a plugin.
    #[must_use]
    pub fn with_settings(mut self, id: impl Into<String>, settings: Value) -> Self {
        self.settings.insert(id.into(), settings);
        self
    }

    /// Whether a plugin is enabled.
    #[must_use]
    pub fn is_enabled(&self, id: &str) -> bool {
        self.enabled.contains(id)
    }

    /// Settings for a plugin, or `null`.
    #[must_use]
    pub fn settings_for(&self, id: &str) -> Value {
        self.settings.get(id).cloned().unwrap_or(Value::Null)
    }
}

/// Generate a fresh bearer token: 32 random bytes, hex encoded.
#[must_use]
pub fn generate_auth_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Discovers, loads and tracks plugins.
pub struct PluginLoader {
    config: LoaderConfig,
    registered: Vec<PluginManifest>,
    known: RwLock<Vec<Arc<PluginManifest>>>,
    registry: Mutex<InstanceRegistry>,
    /// One slot per id with a load in progress.
    loading: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    preferences: PluginPreferences,
    events: EventBroadcaster,
}

impl PluginLoader {
    /// Create a loader.
    #[must_use]
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            registered: Vec::new(),
            known: RwLock::new(Vec::new()),
            registry: Mutex::new(InstanceRegistry::new()),
            loading: std::sync::Mutex::new(HashMap::new()),
            preferences: PluginPreferences::default(),
            events: EventBroadcaster::new(),
        }
    }

    /// Register a manifest programmatically.
    #[must_use]
    pub fn with_manifest(mut self, manifest: PluginManifest) -> Self {
        self.registered.push(manifest);
        self
    }

    /// Use host preferences for enabled plugins and settings.
    #[must_use]
    pub fn with_preferences(mut self, preferences: PluginPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Loader configuration.
    #[must_use]
    pub const fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Subscribe to plugin lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEventEnvelope> {
        self.events.subscribe()
    }

    /// Rescan for manifests.
    ///
    /// Order: built-in, registered, then the plugins directory. When two
    /// manifests share an id the first one wins.
    pub fn discover(&self) -> Vec<Arc<PluginManifest>> {
        self.merge(discover_manifests(&self.config.plugins_dir))
    }

    /// [`discover`](Self::discover) with the directory scan on the blocking pool.
    async fn rediscover(&self) -> Vec<Arc<PluginManifest>> {
        let dir = self.config.plugins_dir.clone();
        let scanned = tokio::task::spawn_blocking(move || discover_manifests(&dir))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Plugin directory scan failed");
                Vec::new()
            });
        self.merge(scanned)
    }

    fn merge(&self, scanned: Vec<PluginManifest>) -> Vec<Arc<PluginManifest>> {
        let builtin = if self.config.builtin_plugins {
            builtin_manifests()
        } else {
            Vec::new()
        };

        let mut seen = HashSet::new();
        let mut manifests = Vec::new();
        for manifest in builtin
            .into_iter()
            .chain(self.registered.iter().cloned())
            .chain(scanned)
        {
            if seen.insert(manifest.id.clone()) {
                manifests.push(Arc::new(manifest));
            } else {
                tracing::debug!(plugin = %manifest.id, "Ignoring duplicate plugin manifest");
            }
        }

        tracing::debug!(count = manifests.len(), "Plugin discovery complete");
        *self.known.write().unwrap_or_else(PoisonError::into_inner) = manifests.clone();
        manifests
    }

    /// Manifests found by the last discovery.
    #[must_use]
    pub fn available_plugins(&self) -> Vec<Arc<PluginManifest>> {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn manifest(&self, id: &str) -> Option<Arc<PluginManifest>> {
        let find = |manifests: &[Arc<PluginManifest>]| manifests.iter().find(|m| m.id == id).cloned();
        if let Some(manifest) = find(&self.available_plugins()) {
            return Some(manifest);
        }
        find(&self.rediscover().await)
    }

    /// Load a plugin, or return the instance already loaded.
    ///
    /// A native instance that was stopped or whose process has exited is
    /// replaced. Kinds without a runtime are registered with `error` status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id, or the launch/handshake error
    /// for a native plugin. Nothing is registered on error.
    pub async fn load(&self, id: &str) -> Result<Arc<PluginInstance>, PluginError> {
        let slot = self.load_slot(id);
        let result = {
            let _loading = slot.lock().await;
            self.load_exclusive(id).await
        };
        self.release_load_slot(id, &slot);
        result
    }

    fn load_slot(&self, id: &str) -> Arc<Mutex<()>> {
        let mut slots = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    fn release_load_slot(&self, id: &str, slot: &Arc<Mutex<()>>) {
        let mut slots = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        // Held by the map and this caller only: nobody is queued behind it.
        let current = slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot));
        if current && Arc::strong_count(slot) == 2 {
            slots.remove(id);
        }
    }

    /// Body of `load`, run while holding the id's load slot.
    async fn load_exclusive(&self, id: &str) -> Result<Arc<PluginInstance>, PluginError> {
        {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.get(id) {
                if !existing.is_reloadable() {
                    return Ok(Arc::clone(existing));
                }
                tracing::info!(plugin = %id, "Replacing terminated plugin instance");
                registry.remove(id);
            }
        }

        match self.instantiate(id).await {
            Ok(instance) => {
                self.registry.lock().await.register(Arc::clone(&instance));
                if instance.bridge().is_some() {
                    tracing::info!(plugin = %id, "Plugin loaded");
                    self.events.broadcast(PluginEvent::Ready { id: id.to_string() });
                }
                Ok(instance)
            }
            Err(e) => {
                tracing::warn!(plugin = %id, error = %e, "Failed to load plugin");
                self.events.broadcast(PluginEvent::Error {
                    id: id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn instantiate(&self, id: &str) -> Result<Arc<PluginInstance>, PluginError> {
        let manifest = self
            .manifest(id)
            .await
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let status: SharedStatus = Arc::new(RwLock::new(PluginStatus::Loading));
        let enabled = self.preferences.is_enabled(id);
        let settings = self.preferences.settings_for(id);

        match manifest.kind {
            PluginKind::Native => {
                let bridge = self.native_bridge(&manifest, &status)?;
                bridge.start().await?;
                write_status(&status, PluginStatus::Ready);
                Ok(Arc::new(PluginInstance::new(
                    manifest,
                    status,
                    InstanceBackend::Bridge(bridge),
                    enabled,
                    settings,
                )))
            }
            kind @ (PluginKind::Wasm | PluginKind::Iframe | PluginKind::Worker) => {
                write_status(&status, PluginStatus::Error);
                let error = PluginError::UnsupportedKind(kind);

                tracing::warn!(plugin = %id, %kind, "Plugin kind has no runtime");
                self.events.broadcast(PluginEvent::Error {
                    id: id.to_string(),
                    error: error.to_string(),
                });
                Ok(Arc::new(PluginInstance::new(
                    manifest,
                    status,
                    InstanceBackend::NotImplemented(kind),
                    enabled,
                    settings,
                )))
            }
        }
    }

    fn native_bridge(
        &self,
        manifest: &PluginManifest,
        status: &SharedStatus,
    ) -> Result<PluginBridge, PluginError> {
        let entry = manifest.entry.native.as_ref().ok_or_else(|| {
            PluginError::InvalidManifest(format!("'{}' has no native entry", manifest.id))
        })?;

        let mut spec = entry.launch_spec();
        if let Some(var) = &entry.auth_token_env {
            spec = spec.env(var.clone(), generate_auth_token());
        }

        let channel: Arc<dyn PluginChannel> = match self.config.channel {
            ChannelMode::Process => Arc::new(ProcessChannel::new(spec)),
            ChannelMode::Simulated => Arc::new(SimulatedChannel::new()),
            ChannelMode::Auto => {
                if which::which(&spec.program).is_ok() {
                    Arc::new(ProcessChannel::new(spec))
                } else {
                    tracing::warn!(
                        plugin = %manifest.id,
                        command = %spec.program.display(),
                        "Plugin executable not found, using simulated channel"
                    );
                    Arc::new(SimulatedChannel::new())
                }
            }
        };

        let message_events = self.events.clone();
        let message_id = manifest.id.clone();
        let exit_events = self.events.clone();
        let exit_id = manifest.id.clone();
        let exit_status = Arc::clone(status);

        let hooks = BridgeHooks::default()
            .on_event(move |event| {
                message_events.broadcast(PluginEvent::Message {
                    id: message_id.clone(),
                    event,
                });
            })
            .on_exit(move |code| {
                write_status(&exit_status, PluginStatus::Error);
                exit_events.broadcast(PluginEvent::Exited {
                    id: exit_id.clone(),
                    code,
                });
            });

        Ok(PluginBridge::new(
            manifest.id.clone(),
            channel,
            self.config.bridge_config(),
            hooks,
        ))
    }

    /// Stop and remove a plugin. Returns the removed instance, if any.
    pub async fn unload(&self, id: &str) -> Option<Arc<PluginInstance>> {
        let instance = self.registry.lock().await.remove(id)?;
        instance.stop();
        tracing::info!(plugin = %id, "Plugin unloaded");
        Some(instance)
    }

    /// Get a loaded plugin.
    pub async fn get(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.registry.lock().await.get(id).cloned()
    }

    /// Whether a plugin is loaded.
    pub async fn is_loaded(&self, id: &str) -> bool {
        self.registry.lock().await.contains(id)
    }

    /// IDs of loaded plugins, sorted.
    pub async fn loaded_plugins(&self) -> Vec<String> {
        self.registry
            .lock()
            .await
            .list()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Stop every loaded plugin and clear the registry.
    pub async fn stop_all(&self) {
        let instances = self.registry.lock().await.drain();
        if instances.is_empty() {
            return;
        }
        tracing::info!(count = instances.len(), "Stopping all plugins");
        for instance in instances {
            instance.stop();
        }
    }

    /// Load every plugin the preferences enable.
    ///
    /// Failures are logged and broadcast; they do not stop the others.
    pub async fn load_enabled(&self) -> Vec<Arc<PluginInstance>> {
        let mut loaded = Vec::new();
        for id in &self.preferences.enabled {
            if let Ok(instance) = self.load(id).await {
                loaded.push(instance);
            }
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::NativeEntry;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: &Path) -> LoaderConfig {
        LoaderConfig {
            plugins_dir: dir.to_path_buf(),
            channel: ChannelMode::Simulated,
            ..LoaderConfig::default()
        }
    }

    fn native(id: &str, command: &str) -> PluginManifest {
        PluginManifest::native(
            id,
            id,
            NativeEntry {
                command: PathBuf::from(command),
                args: Vec::new(),
                env: std::collections::BTreeMap::new(),
                cwd: None,
                auth_token_env: None,
            },
        )
    }

    fn drain(rx: &mut broadcast::Receiver<PluginEventEnvelope>) -> Vec<PluginEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    #[test]
    fn test_auth_token_shape() {
        let token = generate_auth_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_auth_token());
    }

    #[test]
    fn test_discover_order_and_duplicates() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("frame.json"),
            r#"{ id: "frame", name: "Frame", version: "1.0.0", kind: "iframe" }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("dup.json"),
            r#"{ id: "local", name: "Shadowed", version: "9.9.9", kind: "worker" }"#,
        )
        .unwrap();

        let loader = PluginLoader::new(config(dir.path())).with_manifest(native("local", "local-bin"));
        assert!(loader.available_plugins().is_empty());

        let ids: Vec<String> = loader.discover().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["diamond-drill", "local", "frame"]);

        let local = loader
            .available_plugins()
            .into_iter()
            .find(|m| m.id == "local")
            .unwrap();
        assert_eq!(local.kind, PluginKind::Native);
    }

    #[test]
    fn test_discover_without_builtins() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig {
            builtin_plugins: false,
            ..config(dir.path())
        });
        assert!(loader.discover().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_is_idempotent() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(config(dir.path()));
        let mut rx = loader.subscribe();

        let first = loader.load("diamond-drill").await.unwrap();
        let second = loader.load("diamond-drill").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.status(), PluginStatus::Ready);
        assert_eq!(loader.loaded_plugins().await, vec!["diamond-drill".to_string()]);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![PluginEvent::Ready {
                id: "diamond-drill".to_string()
            }]
        );

        let pong = first.send("ping", json!({}), None).await.unwrap();
        assert_eq!(pong["pong"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_instance() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(config(dir.path()));

        let (a, b) = tokio::join!(loader.load("diamond-drill"), loader.load("diamond-drill"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    /// Native plugin that never completes the handshake.
    #[cfg(unix)]
    fn silent(id: &str) -> PluginManifest {
        let mut manifest = native(id, "sh");
        if let Some(entry) = manifest.entry.native.as_mut() {
            entry.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        }
        manifest
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshakes_do_not_block_each_other_or_queries() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig {
            channel: ChannelMode::Process,
            builtin_plugins: false,
            handshake_timeout_ms: 500,
            ..config(dir.path())
        })
        .with_manifest(silent("slow-a"))
        .with_manifest(silent("slow-b"));
        loader.discover();

        let started = std::time::Instant::now();
        let queries = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let answered = tokio::time::timeout(Duration::from_millis(200), async {
                (loader.loaded_plugins().await, loader.is_loaded("slow-a").await)
            })
            .await;
            (answered, started.elapsed())
        };
        let (a, b, (answered, answered_at)) =
            tokio::join!(loader.load("slow-a"), loader.load("slow-b"), queries);

        assert!(matches!(a, Err(PluginError::HandshakeTimeout(_))));
        assert!(matches!(b, Err(PluginError::HandshakeTimeout(_))));
        // The two handshake windows overlapped.
        assert!(started.elapsed() < Duration::from_millis(900));

        let (loaded, slow_loaded) = answered.expect("query waited on a handshake");
        assert!(loaded.is_empty());
        assert!(!slow_loaded);
        assert!(answered_at < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_load_unknown() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(config(dir.path()));
        let mut rx = loader.subscribe();

        let err = loader.load("nope").await.unwrap_err();
        assert_eq!(err, PluginError::NotFound("nope".to_string()));
        assert!(!loader.is_loaded("nope").await);
        assert!(matches!(drain(&mut rx).as_slice(), [PluginEvent::Error { .. }]));
    }

    #[tokio::test]
    async fn test_load_stub_kind() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("wasm.json"),
            r#"{ id: "wasm-thing", name: "Wasm", version: "1.0.0", kind: "wasm" }"#,
        )
        .unwrap();
        let loader = PluginLoader::new(config(dir.path()));
        let mut rx = loader.subscribe();

        let instance = loader.load("wasm-thing").await.unwrap();
        assert_eq!(instance.status(), PluginStatus::Error);
        assert!(loader.is_loaded("wasm-thing").await);

        let err = instance.send("ping", json!({}), None).await.unwrap_err();
        assert_eq!(err, PluginError::UnsupportedKind(PluginKind::Wasm));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![PluginEvent::Error {
                id: "wasm-thing".to_string(),
                error: "Plugin kind 'wasm' is not supported".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig {
            channel: ChannelMode::Process,
            ..config(dir.path())
        })
        .with_manifest(native("ghost", "/nonexistent/mdreader-ghost-plugin"));

        let err = loader.load("ghost").await.unwrap_err();
        assert!(matches!(err, PluginError::Spawn(_)));
        assert!(!loader.is_loaded("ghost").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_mode_falls_back_to_simulation() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig {
            channel: ChannelMode::Auto,
            ..config(dir.path())
        })
        .with_manifest(native("ghost", "mdreader-ghost-plugin-not-on-path"));

        let instance = loader.load("ghost").await.unwrap();
        assert_eq!(instance.status(), PluginStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(config(dir.path()));
        assert!(loader.unload("diamond-drill").await.is_none());

        loader.load("diamond-drill").await.unwrap();
        let removed = loader.unload("diamond-drill").await.unwrap();
        assert_eq!(removed.status(), PluginStatus::Stopped);
        assert!(!loader.is_loaded("diamond-drill").await);
        assert!(loader.get("diamond-drill").await.is_none());

        let err = removed.send("ping", json!({}), None).await.unwrap_err();
        assert!(matches!(err, PluginError::NotReady(_)));
        removed.wait_terminated().await;

        assert!(loader.unload("diamond-drill").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_instance_is_replaced() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(config(dir.path()));

        let first = loader.load("diamond-drill").await.unwrap();
        assert!(!first.is_reloadable());
        first.stop();
        first.wait_terminated().await;
        assert!(first.is_reloadable());

        let second = loader.load("diamond-drill").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), PluginStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_enabled_and_stop_all() {
        let dir = tempdir().unwrap();
        let preferences = PluginPreferences::default()
            .enable("diamond-drill")
            .enable("missing")
            .with_settings("diamond-drill", json!({ "theme": "light" }));
        let loader = PluginLoader::new(config(dir.path())).with_preferences(preferences);

        let loaded = loader.load_enabled().await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].enabled());
        assert_eq!(loaded[0].settings()["theme"], "light");

        loader.stop_all().await;
        assert!(loader.loaded_plugins().await.is_empty());
        assert_eq!(loaded[0].status(), PluginStatus::Stopped);
    }

    #[test]
    fn test_preferences_serialization() {
        let preferences: PluginPreferences = serde_json::from_value(json!({
            "enabled": ["diamond-drill"],
            "settings": { "diamond-drill": { "theme": "dark" } }
        }))
        .unwrap();
        assert!(preferences.is_enabled("diamond-drill"));
        assert_eq!(preferences.settings_for("diamond-drill")["theme"], "dark");
        assert_eq!(preferences.settings_for("other"), Value::Null);
    }
}
