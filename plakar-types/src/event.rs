use serde::{Deserialize, Serialize};

use crate::Mac;

/// Events published on the per-request bus while a command runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    BackupStarted { root: String },
    PathProcessed { path: String, size: u64 },
    PathError { path: String, message: String },
    SnapshotCreated { snapshot: Mac },
    RestoreStarted { snapshot: Mac },
    PathRestored { path: String },
    CheckStarted { snapshot: Mac },
    BlobCorrupt { mac: Mac, message: String },
    MaintenanceDone { packfiles_deleted: u64, blobs_tombstoned: u64 },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Sink discarding everything; used by agentless paths without listeners.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}
