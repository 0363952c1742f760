//! Plakar: deduplicating, content-addressed backup.
//!
//! The workspace splits along the storage stack: `plakar-store` (bytes),
//! `plakar-repository` (packfiles, crypto envelope, state logs, packers),
//! `plakar-snapshot` (VFS trees and the backup pipeline), `plakar-cache`
//! (local caches). This crate adds the application context, the agent and
//! the subcommand front end.

pub mod agent;
pub mod commands;
pub mod context;
pub mod events;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
