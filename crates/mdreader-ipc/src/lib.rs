//! # MD Reader Pro IPC
//!
//! Wire protocol and channels for out-of-process plugins.
//!
//! Plugins speak newline-delimited JSON over their stdio: the host writes
//! requests to the plugin's stdin and reads responses and unsolicited events
//! from its stdout. This crate provides:
//! - Message types for requests, responses and the `init`/`shutdown` exchanges
//! - A line framer that reassembles messages across arbitrary chunk boundaries
//! - The [`PluginChannel`] abstraction with a real process implementation and
//!   a simulated one for running without an external binary
//! - A plugin-side runtime ([`server::serve`]) for writing plugins in Rust

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod framing;
pub mod messages;
pub mod server;
pub mod simulated;
pub mod transport;

pub use framing::LineFramer;
pub use messages::{FrameError, InboundMessage, PluginRequest, PluginResponse};
pub use server::{Notifier, PluginHandler, ServeOutcome, serve};
pub use simulated::SimulatedChannel;
pub use transport::{
    ChannelEvent, ChannelEvents, LaunchSpec, PluginChannel, ProcessChannel, TransportError,
};
