//! CLI command implementations.

pub mod plugins;

pub use plugins::run_plugins;
