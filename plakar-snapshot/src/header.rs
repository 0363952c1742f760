//! Snapshot header: the root blob of a snapshot.
//!
//! The header's MAC is the snapshot identifier.

use anyhow::Error;
use serde::{Deserialize, Serialize};

use plakar_types::Mac;

use crate::btree::BtreeInfo;
use crate::entry::Summary;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub version: String,
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub username: String,
}

impl ClientInfo {
    pub fn collect(version: &str) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let username = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_default();
        Self {
            version: version.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname,
            username,
        }
    }
}

/// Describes the source the snapshot was taken from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImporterInfo {
    pub kind: String,
    pub origin: String,
    pub directory: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    pub timestamp: i64,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    pub client: ClientInfo,
    pub importer: ImporterInfo,
    /// Root of the path -> entry tree.
    pub vfs: BtreeInfo,
    /// Root of the path -> error tree.
    pub errors: BtreeInfo,
    pub summary: Summary,
}

impl SnapshotHeader {
    pub const VERSION: u32 = 1;

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Identifier plus parsed header, as returned by listings.
#[derive(Clone, Debug)]
pub struct SnapshotInfo {
    pub id: Mac,
    pub header: SnapshotHeader,
}
