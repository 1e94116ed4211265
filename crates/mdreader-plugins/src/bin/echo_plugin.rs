//! Reference plugin for the MD Reader Pro plugin protocol.
//!
//! Speaks the line protocol on stdio. With `--plugin-mode` it refuses to
//! start unless `PLUGIN_AUTH_TOKEN` holds a 64 character hex token, the same
//! contract the host expects of real analyzers.

use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use mdreader_ipc::{Notifier, PluginHandler, PluginRequest, serve};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const TOKEN_LEN: usize = 64;

#[derive(Parser)]
#[command(name = "mdreader-echo-plugin")]
#[command(author, version, about = "Reference plugin speaking the MD Reader Pro plugin protocol")]
struct Cli {
    /// Run as a host-launched plugin (requires an auth token)
    #[arg(long)]
    plugin_mode: bool,

    /// Bearer token issued by the host
    #[arg(long, env = "PLUGIN_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

fn validate_token(token: Option<&str>) -> Result<(), String> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Err("PLUGIN_AUTH_TOKEN is not set".to_string());
    };
    if token.len() < TOKEN_LEN {
        return Err(format!(
            "PLUGIN_AUTH_TOKEN is too short ({} characters, expected {TOKEN_LEN})",
            token.len()
        ));
    }
    if token.len() > TOKEN_LEN {
        return Err(format!(
            "PLUGIN_AUTH_TOKEN is too long ({} characters, expected {TOKEN_LEN})",
            token.len()
        ));
    }
    if !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("PLUGIN_AUTH_TOKEN must be hexadecimal".to_string());
    }
    Ok(())
}

const CAPABILITIES: &[&str] = &[
    "ping",
    "echo",
    "get_capabilities",
    "sleep",
    "notify",
    "crash",
    "set_theme",
];

struct EchoPlugin;

#[async_trait]
impl PluginHandler for EchoPlugin {
    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn capabilities(&self) -> Vec<String> {
        CAPABILITIES.iter().map(ToString::to_string).collect()
    }

    async fn handle(&self, request: PluginRequest, notifier: &Notifier) -> Result<Value, String> {
        let payload = request.payload;
        match request.action.as_str() {
            "ping" => Ok(json!({ "pong": true })),
            "echo" => Ok(payload),
            "get_capabilities" => Ok(json!({
                "version": self.version(),
                "capabilities": self.capabilities(),
            })),
            "sleep" => {
                let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }
            "notify" => {
                let name = payload
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("progress")
                    .to_string();
                let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));
                notifier.notify(name, data);
                Ok(json!({ "notified": true }))
            }
            "crash" => {
                let code = payload
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(1);
                tracing::warn!(code, "Crashing on request");
                std::process::exit(code);
            }
            "set_theme" => match payload.get("theme").and_then(Value::as_str) {
                Some(theme @ ("dark" | "light")) => Ok(json!({ "theme": theme })),
                Some(other) => Err(format!("Invalid theme: {other}")),
                None => Err("Missing theme".to_string()),
            },
            other => Err(format!("Unknown action: {other}")),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the protocol; logs go to stderr only.
    let filter =
        EnvFilter::try_from_env("MDREADER_PLUGIN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();

    if cli.plugin_mode {
        if let Err(e) = validate_token(cli.auth_token.as_deref()) {
            tracing::error!("{e}");
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    }

    match serve(&EchoPlugin, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(outcome) => {
            tracing::info!(?outcome, "Plugin finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Plugin I/O failed");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_validate_token() {
        let valid = "a".repeat(64);
        assert!(validate_token(Some(&valid)).is_ok());

        assert!(validate_token(None).unwrap_err().contains("not set"));
        assert!(validate_token(Some("")).unwrap_err().contains("not set"));
        assert!(validate_token(Some("abc123")).unwrap_err().contains("too short"));
        assert!(validate_token(Some(&"a".repeat(65))).unwrap_err().contains("too long"));
        assert!(validate_token(Some(&"g".repeat(64))).unwrap_err().contains("hexadecimal"));
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["mdreader-echo-plugin", "--plugin-mode", "--auth-token", "ff"]);
        assert!(cli.plugin_mode);
        assert_eq!(cli.auth_token.as_deref(), Some("ff"));
    }

    #[tokio::test]
    async fn test_actions() {
        // Drive the handler through serve() over an in-memory pipe.
        let (mut host, plugin) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(plugin);
        let server = tokio::spawn(async move { serve(&EchoPlugin, reader, writer).await });

        let requests = [
            json!({ "id": "1", "action": "echo", "payload": { "x": 1 } }),
            json!({ "id": "2", "action": "set_theme", "payload": { "theme": "neon" } }),
            json!({ "id": "3", "action": "nope", "payload": {} }),
            json!({ "id": "shutdown", "action": "shutdown", "payload": {} }),
        ];
        for request in &requests {
            host.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        }

        let mut messages = Vec::new();
        let mut lines = BufReader::new(host).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            messages.push(serde_json::from_str::<Value>(&line).unwrap());
        }

        assert_eq!(messages[0]["id"], "init");
        assert_eq!(messages[1]["data"], json!({ "x": 1 }));
        assert_eq!(messages[2]["error"], "Invalid theme: neon");
        assert_eq!(messages[3]["error"], "Unknown action: nope");
        assert_eq!(messages[4]["id"], "shutdown");

        assert!(server.await.unwrap().is_ok());
    }
}
