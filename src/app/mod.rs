//! Process wiring for the two binaries' subcommands.
//!
//! Both sides take their bus, inbound channel and hardware/store backends
//! as arguments so they can run against in-memory collaborators.

pub mod server;
pub mod transmitter;

pub use server::Server;
pub use transmitter::Transmitter;

use tracing::{info, warn};

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => warn!("Failed to listen for Ctrl-C, shutting down: {}", e),
    }
}
