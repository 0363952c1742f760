//! File content objects.
//!
//! An object is the ordered list of chunk MACs making up one file, plus a
//! digest of the whole content computed with the repository hasher.

use anyhow::Error;
use serde::{Deserialize, Serialize};

use plakar_types::Mac;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub mac: Mac,
    pub length: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Object {
    pub chunks: Vec<ChunkRef>,
    /// MAC over the entire file content.
    pub digest: Mac,
    pub content_type: String,
    pub entropy: f64,
}

impl Object {
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.length as u64).sum()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_round_trip() -> Result<(), Error> {
        let object = Object {
            chunks: vec![
                ChunkRef { mac: Mac::new([1; 32]), length: 100 },
                ChunkRef { mac: Mac::new([2; 32]), length: 50 },
            ],
            digest: Mac::new([3; 32]),
            content_type: "text".into(),
            entropy: 4.2,
        };
        let parsed = Object::deserialize(&object.serialize()?)?;
        assert_eq!(parsed.size(), 150);
        assert_eq!(parsed.chunks, object.chunks);
        Ok(())
    }
}
