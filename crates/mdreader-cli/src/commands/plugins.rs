//! Plugins command - list, call and ping plugins.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdreader_plugins::{ChannelMode, LoaderConfig, PluginEvent, PluginLoader};
use serde_json::Value;

use crate::ui;

/// Plugins command arguments.
#[derive(Debug, Clone)]
pub struct PluginsArgs {
    /// What to do.
    pub action: PluginsAction,
    /// Config file override.
    pub config: Option<PathBuf>,
    /// Plugins directory override.
    pub plugins_dir: Option<PathBuf>,
    /// Force the simulated channel.
    pub simulate: bool,
}

/// Plugins subcommands.
#[derive(Debug, Clone)]
pub enum PluginsAction {
    /// List available plugins.
    List,
    /// Call one action.
    Call {
        /// Plugin ID.
        id: String,
        /// Action name.
        action: String,
        /// Raw JSON payload.
        payload: String,
        /// Request timeout override.
        timeout_ms: Option<u64>,
    },
    /// Ping a plugin.
    Ping {
        /// Plugin ID.
        id: String,
    },
}

/// Run the plugins command.
pub async fn run_plugins(args: PluginsArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let loader = PluginLoader::new(config);

    match args.action {
        PluginsAction::List => {
            list(&loader);
            Ok(())
        }
        PluginsAction::Call {
            id,
            action,
            payload,
            timeout_ms,
        } => {
            let payload = parse_payload(&payload)?;
            call(&loader, &id, &action, payload, timeout_ms.map(Duration::from_millis)).await
        }
        PluginsAction::Ping { id } => ping(&loader, &id).await,
    }
}

fn resolve_config(args: &PluginsArgs) -> Result<LoaderConfig> {
    let config = match &args.config {
        Some(path) => LoaderConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => LoaderConfig::load_default().context("Failed to load plugin config")?,
    };
    Ok(apply_overrides(config, args))
}

/// Command-line flags win over the config file.
fn apply_overrides(mut config: LoaderConfig, args: &PluginsArgs) -> LoaderConfig {
    if let Some(dir) = &args.plugins_dir {
        config.plugins_dir.clone_from(dir);
    }
    if args.simulate {
        config.channel = ChannelMode::Simulated;
    }
    config
}

fn parse_payload(raw: &str) -> Result<Value> {
    let payload: Value = serde_json::from_str(raw).context("Payload is not valid JSON")?;
    anyhow::ensure!(payload.is_object(), "Payload must be a JSON object");
    Ok(payload)
}

fn list(loader: &PluginLoader) {
    ui::header("Available Plugins");
    ui::kv("Plugins dir", &loader.config().plugins_dir.display().to_string());
    println!();

    let manifests = loader.discover();
    if manifests.is_empty() {
        ui::info("No plugins found");
        return;
    }

    ui::table_row(&[("ID", 20), ("NAME", 20), ("KIND", 8), ("VERSION", 10), ("CAPABILITIES", 0)]);
    for manifest in manifests {
        let capabilities = manifest
            .capabilities
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let kind = manifest.kind.to_string();
        ui::table_row(&[
            (manifest.id.as_str(), 20),
            (manifest.name.as_str(), 20),
            (kind.as_str(), 8),
            (manifest.version.as_str(), 10),
            (capabilities.as_str(), 0),
        ]);
    }
}

async fn call(
    loader: &PluginLoader,
    id: &str,
    action: &str,
    payload: Value,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut events = loader.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            match envelope.event {
                PluginEvent::Message { id, event } => ui::info(&format!("[{id}] {event}")),
                PluginEvent::Exited { id, code } => {
                    ui::warning(&format!("Plugin '{id}' exited (code: {code:?})"));
                }
                PluginEvent::Ready { .. } | PluginEvent::Error { .. } => {}
            }
        }
    });

    let instance = loader
        .load(id)
        .await
        .with_context(|| format!("Failed to load plugin '{id}'"))?;
    tracing::debug!(plugin = %id, status = %instance.status(), "Plugin loaded");

    let result = instance.send(action, payload, timeout).await;
    shutdown(loader, id).await;
    watcher.abort();

    match result {
        Ok(data) => {
            ui::success(&format!("{id} → {action}"));
            ui::json(&data);
            Ok(())
        }
        Err(e) => {
            ui::error(&e.to_string());
            Err(e.into())
        }
    }
}

async fn ping(loader: &PluginLoader, id: &str) -> Result<()> {
    let started = Instant::now();
    let instance = loader
        .load(id)
        .await
        .with_context(|| format!("Failed to load plugin '{id}'"))?;
    let handshake = started.elapsed();

    let sent = Instant::now();
    let result = instance.send("ping", Value::Object(serde_json::Map::new()), None).await;
    let round_trip = sent.elapsed();

    ui::header(&format!("Plugin {id}"));
    ui::kv("Status", &ui::status(instance.status()));
    ui::kv("Handshake", &format!("{}ms", handshake.as_millis()));
    shutdown(loader, id).await;

    match result {
        Ok(_) => {
            ui::success(&format!("pong in {}ms", round_trip.as_millis()));
            Ok(())
        }
        Err(e) => {
            ui::error(&e.to_string());
            Err(e.into())
        }
    }
}

/// Unload and give the process a moment to terminate.
async fn shutdown(loader: &PluginLoader, id: &str) {
    let Some(instance) = loader.unload(id).await else {
        return;
    };
    let grace = Duration::from_millis(loader.config().shutdown_grace_ms) + Duration::from_secs(1);
    if tokio::time::timeout(grace, instance.wait_terminated()).await.is_err() {
        ui::warning(&format!("Plugin '{id}' did not terminate in time"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload("{}").unwrap(), serde_json::json!({}));
        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("{not json").is_err());
    }

    #[test]
    fn test_overrides() {
        let args = PluginsArgs {
            action: PluginsAction::List,
            config: None,
            plugins_dir: Some(PathBuf::from("/tmp/mdreader-plugins")),
            simulate: true,
        };
        let config = apply_overrides(LoaderConfig::default(), &args);
        assert_eq!(config.channel, ChannelMode::Simulated);
        assert_eq!(config.plugins_dir, PathBuf::from("/tmp/mdreader-plugins"));

        let untouched = apply_overrides(
            LoaderConfig::default(),
            &PluginsArgs {
                plugins_dir: None,
                simulate: false,
                ..args.clone()
            },
        );
        assert_eq!(untouched, LoaderConfig::default());

        let missing = PathBuf::from("/nonexistent/mdreader/plugins.json");
        let args = PluginsArgs {
            config: Some(missing),
            ..args
        };
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn test_overrides_apply_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, r#"{ channel: "process", requestTimeoutMs: 1234 }"#).unwrap();

        let args = PluginsArgs {
            action: PluginsAction::List,
            config: Some(path),
            plugins_dir: None,
            simulate: true,
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.channel, ChannelMode::Simulated);
        assert_eq!(config.request_timeout_ms, 1234);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_call_and_ping() {
        let config = LoaderConfig {
            plugins_dir: PathBuf::from("/nonexistent/mdreader-plugins"),
            channel: ChannelMode::Simulated,
            ..LoaderConfig::default()
        };
        let loader = PluginLoader::new(config);

        call(&loader, "diamond-drill", "ping", serde_json::json!({}), None)
            .await
            .unwrap();
        assert!(!loader.is_loaded("diamond-drill").await);

        ping(&loader, "diamond-drill").await.unwrap();
        assert!(call(&loader, "diamond-drill", "bogus", serde_json::json!({}), None)
            .await
            .is_err());
    }
}
