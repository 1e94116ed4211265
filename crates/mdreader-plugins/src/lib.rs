//! # MD Reader Pro Plugins
//!
//! Manifest-driven plugin loading and the host side of the plugin protocol.
//!
//! The [`PluginLoader`] discovers [`PluginManifest`]s and turns them into
//! [`PluginInstance`]s. Native plugins run out of process behind a
//! [`PluginBridge`], which performs the ready handshake, correlates requests
//! with responses and enforces timeouts. Other kinds are recognized but have
//! no runtime yet.
//!
//! ```no_run
//! use mdreader_plugins::{LoaderConfig, PluginLoader};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), mdreader_plugins::PluginError> {
//! let loader = PluginLoader::new(LoaderConfig::default());
//! loader.discover();
//! let analyzer = loader.load("diamond-drill").await?;
//! let result = analyzer.send("analyze", json!({ "files": ["README.md"] }), None).await?;
//! println!("{result}");
//! loader.unload("diamond-drill").await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Error and status types.
pub mod api;
/// Request/response bridge to one plugin.
pub mod bridge;
/// Loader configuration.
pub mod config;
/// Lifecycle events.
pub mod events;
/// Loaded plugin instances.
pub mod instance;
/// Plugin loader.
pub mod loader;
/// Plugin manifests and discovery.
pub mod manifest;
/// Instance registry.
pub mod registry;

pub use api::{PluginError, PluginStatus};
pub use bridge::{BridgeConfig, BridgeHooks, BridgePhase, PluginBridge};
pub use config::{ChannelMode, ConfigError, LoaderConfig};
pub use events::{EventBroadcaster, PluginEvent, PluginEventEnvelope};
pub use instance::{InstanceBackend, PluginInstance};
pub use loader::{PluginLoader, PluginPreferences, generate_auth_token};
pub use manifest::{
    MANIFEST_FILE, NativeEntry, PluginEntry, PluginKind, PluginManifest, builtin_manifests,
    discover_manifests,
};
pub use registry::InstanceRegistry;
