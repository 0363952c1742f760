//! Shared type definitions used across the plakar workspace.
//!
//! Everything persistent in a repository is addressed by a [`Mac`] and
//! tagged with a [`ResourceType`] plus a format version, so the wire and
//! storage formats can evolve independently per resource.

mod error;
mod event;
mod mac;
mod resource;
mod token;

pub mod config;

pub use error::{is_cancelled, RepositoryError};
pub use event::{Event, EventSink, NullSink};
pub use mac::Mac;
pub use resource::{ResourceType, BLOB_FLAG_ENCRYPTED};
pub use token::CancelToken;

/// Size of a serialized blob index record inside a packfile.
pub const BLOB_RECORD_SIZE: usize = 56;

/// Size of the packfile footer.
pub const FOOTER_SIZE: usize = 56;
