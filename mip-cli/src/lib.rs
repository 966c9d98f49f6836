//! MIP CLI Library
//!
//! Shared functionality for the MIP command-line tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, ReceiverConfig, SenderConfig};
pub use stats::{
    display_receiver_stats, display_sender_stats, format_bandwidth, format_bytes,
    format_duration, format_offset, ReceiverSnapshot, SenderSnapshot,
};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
