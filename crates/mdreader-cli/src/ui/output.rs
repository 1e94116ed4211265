//! Formatted output utilities.

use console::style;
use mdreader_plugins::PluginStatus;

/// Print a success message with checkmark.
pub fn success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Print an error message with X.
pub fn error(msg: &str) {
    println!("{} {}", style("✗").red().bold(), msg);
}

/// Print a warning message.
pub fn warning(msg: &str) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Print an info message.
pub fn info(msg: &str) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a header/section title.
pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Print a key-value pair.
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", style(key).bold(), value);
}

/// Print a table row.
pub fn table_row(cols: &[(&str, usize)]) {
    for (text, width) in cols {
        print!("{text:width$}");
    }
    println!();
}

/// Print a JSON value, indented.
pub fn json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

/// Colored label for a plugin status.
pub fn status(status: PluginStatus) -> String {
    let text = status.to_string();
    match status {
        PluginStatus::Ready => style(text).green().to_string(),
        PluginStatus::Loading => style(text).yellow().to_string(),
        PluginStatus::Error => style(text).red().to_string(),
        PluginStatus::Stopped => style(text).dim().to_string(),
    }
}
