//! Plugin manifests and discovery.
//!
//! A manifest is the static description of a plugin: identity, kind,
//! capabilities, how to launch it and what it needs. Manifests are camelCase
//! JSON on disk; JSON5 is accepted so authors can leave comments in them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use mdreader_ipc::LaunchSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::PluginError;

/// File name looked for inside each plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// How a plugin is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Out-of-process executable speaking the line protocol over stdio.
    Native,
    /// WebAssembly module.
    Wasm,
    /// Sandboxed web frame.
    Iframe,
    /// Background web worker.
    Worker,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Native => "native",
            Self::Wasm => "wasm",
            Self::Iframe => "iframe",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

/// Launch spec for `native` plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeEntry {
    /// Executable path or name on `PATH`.
    pub command: PathBuf,
    /// Ordered arguments, passed through untouched.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Environment variable that receives a per-launch bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,
}

impl NativeEntry {
    /// Build the process launch spec, without any auth token.
    #[must_use]
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// Per-kind entry points. Only the one matching the manifest kind is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    /// Native executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeEntry>,
    /// WebAssembly module path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasm: Option<String>,
    /// Frame URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iframe: Option<String>,
    /// Worker script path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Static description of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Execution kind.
    pub kind: PluginKind,
    /// Actions the plugin offers.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Entry points by kind.
    #[serde(default)]
    pub entry: PluginEntry,
    /// Permissions the plugin requires.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// JSON schema for the plugin's settings.
    #[serde(default)]
    pub settings_schema: Value,
}

impl PluginManifest {
    /// Create a native manifest.
    #[must_use]
    pub fn native(id: impl Into<String>, name: impl Into<String>, entry: NativeEntry) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.1.0".to_string(),
            description: String::new(),
            kind: PluginKind::Native,
            capabilities: BTreeSet::new(),
            entry: PluginEntry {
                native: Some(entry),
                ..PluginEntry::default()
            },
            permissions: BTreeSet::new(),
            settings_schema: Value::Null,
        }
    }

    /// Parse a manifest from JSON5 text and validate it.
    ///
    /// # Errors
    ///
    /// Returns error if the text does not parse or the manifest is invalid.
    pub fn from_json5(content: &str) -> Result<Self, PluginError> {
        let manifest: Self =
            json5::from_str(content).map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check required fields and that the kind has an entry.
    ///
    /// # Errors
    ///
    /// Returns error describing the first problem found.
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::InvalidManifest("id is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidManifest(format!(
                "'{}' has an empty name",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(PluginError::InvalidManifest(format!(
                "'{}' has an empty version",
                self.id
            )));
        }

        if self.kind == PluginKind::Native {
            let Some(native) = &self.entry.native else {
                return Err(PluginError::InvalidManifest(format!(
                    "'{}' is native but has no native entry",
                    self.id
                )));
            };
            if native.command.as_os_str().is_empty() {
                return Err(PluginError::InvalidManifest(format!(
                    "'{}' has an empty native command",
                    self.id
                )));
            }
        }

        Ok(())
    }

    /// Whether the plugin declares a capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Manifests shipped with the host.
///
/// Currently the Diamond Drill file analyzer, launched in plugin mode with a
/// host-issued token.
#[must_use]
pub fn builtin_manifests() -> Vec<PluginManifest> {
    let entry = NativeEntry {
        command: PathBuf::from("diamond"),
        args: vec!["--plugin-mode".to_string()],
        env: BTreeMap::new(),
        cwd: None,
        auth_token_env: Some("PLUGIN_AUTH_TOKEN".to_string()),
    };

    let mut analyzer = PluginManifest::native("diamond-drill", "Diamond Drill", entry);
    analyzer.description = "Read-only file analyzer".to_string();
    analyzer.capabilities = ["analyze", "deep_analyze", "report", "browse"]
        .into_iter()
        .map(String::from)
        .collect();
    analyzer.permissions = ["fs:read"].into_iter().map(String::from).collect();
    analyzer.settings_schema = serde_json::json!({
        "type": "object",
        "properties": {
            "theme": { "type": "string", "enum": ["dark", "light"], "default": "dark" },
            "allowedDirectories": { "type": "array", "items": { "type": "string" } }
        }
    });

    vec![analyzer]
}

/// Discover manifests in a plugins directory.
///
/// Reads `<dir>/<plugin>/plugin.json` and `<dir>/*.json`. Files that fail to
/// parse or validate are logged and skipped. A missing directory yields
/// nothing.
pub fn discover_manifests(dir: &Path) -> Vec<PluginManifest> {
    let mut manifests = Vec::new();

    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::debug!(dir = %dir.display(), "Plugins directory not readable");
        return manifests;
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter_map(|path| {
            if path.is_dir() {
                let candidate = path.join(MANIFEST_FILE);
                candidate.is_file().then_some(candidate)
            } else if path.extension().is_some_and(|ext| ext == "json") {
                Some(path)
            } else {
                None
            }
        })
        .collect();
    paths.sort();

    for path in paths {
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))
            .and_then(|content| PluginManifest::from_json5(&content));

        match parsed {
            Ok(manifest) => {
                tracing::debug!(plugin = %manifest.id, path = %path.display(), "Discovered plugin");
                manifests.push(manifest);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest");
            }
        }
    }

    manifests
}
