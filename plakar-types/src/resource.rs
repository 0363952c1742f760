use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Blob flag bit 0: payload is encrypted with the repository envelope.
pub const BLOB_FLAG_ENCRYPTED: u32 = 1 << 0;

/// Type tag attached to every stored blob.
///
/// Encoded as a little endian `u32` in binary formats. Each type carries
/// its own format version so resources can evolve independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Config,
    Chunk,
    Object,
    File,
    Directory,
    Vfs,
    VfsBtree,
    ErrorBtree,
    Xattr,
    Snapshot,
    Packfile,
    PackfileIndex,
    PackfileFooter,
    State,
    Lock,
}

impl ResourceType {
    pub fn as_u32(self) -> u32 {
        match self {
            ResourceType::Config => 1,
            ResourceType::Chunk => 2,
            ResourceType::Object => 3,
            ResourceType::File => 4,
            ResourceType::Directory => 5,
            ResourceType::Vfs => 6,
            ResourceType::VfsBtree => 7,
            ResourceType::ErrorBtree => 8,
            ResourceType::Xattr => 9,
            ResourceType::Snapshot => 10,
            ResourceType::Packfile => 11,
            ResourceType::PackfileIndex => 12,
            ResourceType::PackfileFooter => 13,
            ResourceType::State => 14,
            ResourceType::Lock => 15,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self, Error> {
        Ok(match value {
            1 => ResourceType::Config,
            2 => ResourceType::Chunk,
            3 => ResourceType::Object,
            4 => ResourceType::File,
            5 => ResourceType::Directory,
            6 => ResourceType::Vfs,
            7 => ResourceType::VfsBtree,
            8 => ResourceType::ErrorBtree,
            9 => ResourceType::Xattr,
            10 => ResourceType::Snapshot,
            11 => ResourceType::Packfile,
            12 => ResourceType::PackfileIndex,
            13 => ResourceType::PackfileFooter,
            14 => ResourceType::State,
            15 => ResourceType::Lock,
            other => bail!("unknown resource type tag {}", other),
        })
    }

    /// Current serialization version for this resource type.
    pub fn version(self) -> u32 {
        1
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Config => "config",
            ResourceType::Chunk => "chunk",
            ResourceType::Object => "object",
            ResourceType::File => "file",
            ResourceType::Directory => "directory",
            ResourceType::Vfs => "vfs",
            ResourceType::VfsBtree => "vfs-btree",
            ResourceType::ErrorBtree => "error-btree",
            ResourceType::Xattr => "xattr",
            ResourceType::Snapshot => "snapshot",
            ResourceType::Packfile => "packfile",
            ResourceType::PackfileIndex => "packfile-index",
            ResourceType::PackfileFooter => "packfile-footer",
            ResourceType::State => "state",
            ResourceType::Lock => "lock",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for tag in 1..=15u32 {
            let resource = ResourceType::from_u32(tag).unwrap();
            assert_eq!(resource.as_u32(), tag);
        }
        assert!(ResourceType::from_u32(0).is_err());
        assert!(ResourceType::from_u32(16).is_err());
    }
}
