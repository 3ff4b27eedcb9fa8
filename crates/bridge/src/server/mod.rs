//! REPL server: TCP listener, per-connection sessions, discovery files.

mod discovery;
mod server;

pub use discovery::{discovery_file_path, DiscoveryManager};
pub use server::{ReplServer, ServerConfig, ServerMetrics, MAX_CONNECTIONS};
