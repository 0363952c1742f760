//! Repository configuration blob.
//!
//! Written exactly once at repository creation, stored under the `CONFIG`
//! name wrapped with a detached type/version header. Never compressed or
//! encrypted: it has to be readable before the repository is unlocked.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const KIB: u32 = 1024;
pub const MIB: u32 = 1024 * 1024;

/// Serialized as part of the configuration; carries base64 payloads so the
/// JSON stays printable.
pub mod bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        base64::encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let string = String::deserialize(deserializer)?;
        base64::decode(string).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackfileConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for PackfileConfig {
    fn default() -> Self {
        Self {
            min_size: MIB,
            avg_size: 4 * MIB,
            max_size: 20 * MIB,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub algorithm: String,
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            algorithm: "fastcdc".to_string(),
            min_size: 64 * KIB,
            avg_size: 256 * KIB,
            max_size: MIB,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashingConfig {
    pub algorithm: String,
    pub bits: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            algorithm: "sha256".to_string(),
            bits: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: String,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: "zstd".to_string(),
            level: 3,
        }
    }
}

/// scrypt parameters, stored verbatim so the master key can be re-derived.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(with = "bytes_as_base64")]
    pub salt: Vec<u8>,
    pub n: u64,
    pub r: u64,
    pub p: u64,
    pub key_len: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub algorithm: String,
    pub kdf: String,
    pub kdf_params: KdfParams,
    /// Random 32 byte payload sealed under the master key; a candidate key
    /// is accepted iff decrypting it succeeds.
    #[serde(with = "bytes_as_base64")]
    pub canary: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    pub version: u32,
    pub timestamp: i64,
    pub repository_id: Uuid,
    pub packfile: PackfileConfig,
    pub chunking: ChunkingConfig,
    pub hashing: HashingConfig,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub compression: Option<CompressionConfig>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encryption: Option<EncryptionConfig>,
}

impl Configuration {
    pub const VERSION: u32 = 1;

    pub fn new(timestamp: i64) -> Self {
        Self {
            version: Self::VERSION,
            timestamp,
            repository_id: Uuid::new_v4(),
            packfile: PackfileConfig::default(),
            chunking: ChunkingConfig::default(),
            hashing: HashingConfig::default(),
            compression: Some(CompressionConfig::default()),
            encryption: None,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let config: Configuration = serde_json::from_slice(data)?;
        if config.version != Self::VERSION {
            bail!("unsupported repository format version {}", config.version);
        }
        if config.chunking.min_size == 0 || config.chunking.min_size > config.chunking.max_size {
            bail!("invalid chunking configuration");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_round_trip() {
        let config = Configuration::new(1700000000);
        let data = config.serialize().unwrap();
        let parsed = Configuration::deserialize(&data).unwrap();
        assert_eq!(parsed.repository_id, config.repository_id);
        assert_eq!(parsed.packfile.max_size, 20 * MIB);
        assert!(parsed.encryption.is_none());
    }

    #[test]
    fn rejects_future_version() {
        let mut config = Configuration::new(0);
        config.version = 99;
        let data = serde_json::to_vec(&config).unwrap();
        assert!(Configuration::deserialize(&data).is_err());
    }
}
