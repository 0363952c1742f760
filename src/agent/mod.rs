//! Long-lived agent owning repository handles and serving clients over a
//! local socket.

pub mod client;
pub mod daemon;
pub mod protocol;
pub mod server;

use std::path::PathBuf;

pub use protocol::{CommandRequest, Packet, Request, PROTOCOL_VERSION};

/// Socket path under the cache directory.
pub fn socket_path(cache_base: &std::path::Path) -> PathBuf {
    cache_base.join("agent.sock")
}

/// Pidfile written by the daemonised agent.
pub fn pidfile_path(cache_base: &std::path::Path) -> PathBuf {
    cache_base.join("agent.pid")
}
