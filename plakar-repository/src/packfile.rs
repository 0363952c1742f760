//! Packfile container codec.
//!
//! A sealed packfile is laid out as:
//!
//! ```text
//! [ blob bytes concatenated                  (index_offset bytes) ]
//! [ blob index: count x BlobRecord(56)                            ]
//! [ footer: timestamp(8) count(4) index_offset(8) index_mac(32) flags(4) ]
//! ```
//!
//! The index MAC is computed with the repository hasher over the serialised
//! index records and verified on every parse. The codec round-trips byte
//! for byte.

use anyhow::{bail, Error};

use plakar_types::{Mac, RepositoryError, ResourceType, BLOB_RECORD_SIZE, FOOTER_SIZE};

use crate::hasher::MacHasher;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobRecord {
    pub resource: ResourceType,
    pub version: u32,
    pub mac: Mac,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

impl BlobRecord {
    pub fn serialize(&self) -> [u8; BLOB_RECORD_SIZE] {
        let mut out = [0u8; BLOB_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.resource.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..40].copy_from_slice(self.mac.as_bytes());
        out[40..48].copy_from_slice(&self.offset.to_le_bytes());
        out[48..52].copy_from_slice(&self.length.to_le_bytes());
        out[52..56].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() != BLOB_RECORD_SIZE {
            bail!("wrong blob record size {}", data.len());
        }
        Ok(Self {
            resource: ResourceType::from_u32(u32::from_le_bytes(data[0..4].try_into().unwrap()))?,
            version: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            mac: Mac::from_slice(&data[8..40])?,
            offset: u64::from_le_bytes(data[40..48].try_into().unwrap()),
            length: u32::from_le_bytes(data[48..52].try_into().unwrap()),
            flags: u32::from_le_bytes(data[52..56].try_into().unwrap()),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackfileFooter {
    pub timestamp: i64,
    pub count: u32,
    pub index_offset: u64,
    pub index_mac: Mac,
    pub flags: u32,
}

impl PackfileFooter {
    pub fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.count.to_le_bytes());
        out[12..20].copy_from_slice(&self.index_offset.to_le_bytes());
        out[20..52].copy_from_slice(self.index_mac.as_bytes());
        out[52..56].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() != FOOTER_SIZE {
            bail!("wrong footer size {}", data.len());
        }
        Ok(Self {
            timestamp: i64::from_le_bytes(data[0..8].try_into().unwrap()),
            count: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            index_offset: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            index_mac: Mac::from_slice(&data[20..52])?,
            flags: u32::from_le_bytes(data[52..56].try_into().unwrap()),
        })
    }
}

pub fn serialize_index(records: &[BlobRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * BLOB_RECORD_SIZE);
    for record in records {
        out.extend_from_slice(&record.serialize());
    }
    out
}

/// Accumulates blobs for one in-flight packfile.
pub struct PackfileWriter {
    blobs: Vec<u8>,
    index: Vec<BlobRecord>,
}

impl PackfileWriter {
    pub fn new() -> Self {
        Self {
            blobs: Vec::new(),
            index: Vec::new(),
        }
    }

    /// Append a blob; the offset is the current length of the blob region.
    pub fn add_blob(
        &mut self,
        resource: ResourceType,
        version: u32,
        mac: Mac,
        data: &[u8],
        flags: u32,
    ) -> BlobRecord {
        let record = BlobRecord {
            resource,
            version,
            mac,
            offset: self.blobs.len() as u64,
            length: data.len() as u32,
            flags,
        };
        self.blobs.extend_from_slice(data);
        self.index.push(record);
        record
    }

    /// Current size of the blob region plus index and footer.
    pub fn size(&self) -> u64 {
        (self.blobs.len() + self.index.len() * BLOB_RECORD_SIZE + FOOTER_SIZE) as u64
    }

    pub fn blob_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Seal into the final byte sequence, consuming the writer.
    pub fn seal(self, hasher: &MacHasher, timestamp: i64) -> (Vec<u8>, Vec<BlobRecord>) {
        let raw_index = serialize_index(&self.index);
        let footer = PackfileFooter {
            timestamp,
            count: self.index.len() as u32,
            index_offset: self.blobs.len() as u64,
            index_mac: hasher.mac(&raw_index),
            flags: 0,
        };

        let mut out = self.blobs;
        out.extend_from_slice(&raw_index);
        out.extend_from_slice(&footer.serialize());
        (out, self.index)
    }
}

impl Default for PackfileWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed packfile with verified footer and index.
#[derive(Debug)]
pub struct Packfile {
    pub footer: PackfileFooter,
    pub index: Vec<BlobRecord>,
    blobs: Vec<u8>,
}

impl Packfile {
    pub fn parse(hasher: &MacHasher, data: &[u8]) -> Result<Self, Error> {
        if data.len() < FOOTER_SIZE {
            return Err(integrity("packfile too short"));
        }
        let footer = PackfileFooter::parse(&data[data.len() - FOOTER_SIZE..])?;

        let index_len = footer.count as usize * BLOB_RECORD_SIZE;
        let expected_len = footer.index_offset as usize + index_len + FOOTER_SIZE;
        if expected_len != data.len() {
            return Err(integrity("packfile length does not match footer"));
        }

        let raw_index = &data[footer.index_offset as usize..footer.index_offset as usize + index_len];
        if hasher.mac(raw_index) != footer.index_mac {
            return Err(integrity("packfile index MAC mismatch"));
        }

        let mut index = Vec::with_capacity(footer.count as usize);
        for raw in raw_index.chunks_exact(BLOB_RECORD_SIZE) {
            let record = BlobRecord::parse(raw)?;
            if record.offset + record.length as u64 > footer.index_offset {
                return Err(integrity("blob extends beyond the blob region"));
            }
            index.push(record);
        }

        Ok(Self {
            footer,
            index,
            blobs: data[..footer.index_offset as usize].to_vec(),
        })
    }

    pub fn get_blob(&self, mac: &Mac) -> Option<&[u8]> {
        let record = self.index.iter().find(|record| record.mac == *mac)?;
        Some(&self.blobs[record.offset as usize..record.offset as usize + record.length as usize])
    }

    pub fn blob_region(&self) -> &[u8] {
        &self.blobs
    }
}

fn integrity(message: &str) -> Error {
    RepositoryError::Integrity(message.to_string()).into()
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_packfile(hasher: &MacHasher) -> (Vec<u8>, Vec<BlobRecord>) {
        let mut writer = PackfileWriter::new();
        writer.add_blob(ResourceType::Chunk, 1, Mac::new([1; 32]), b"first chunk", 0);
        writer.add_blob(ResourceType::Chunk, 1, Mac::new([2; 32]), b"second", 0);
        writer.add_blob(ResourceType::Object, 1, Mac::new([3; 32]), b"{}", 0);
        writer.seal(hasher, 1700000000)
    }

    #[test]
    fn round_trip_is_byte_exact() -> Result<(), Error> {
        let hasher = MacHasher::plain();
        let (data, records) = sample_packfile(&hasher);

        let packfile = Packfile::parse(&hasher, &data)?;
        assert_eq!(packfile.footer.count, 3);
        assert_eq!(packfile.index, records);
        assert_eq!(packfile.get_blob(&Mac::new([1; 32])).unwrap(), b"first chunk");
        assert_eq!(packfile.get_blob(&Mac::new([2; 32])).unwrap(), b"second");

        // re-seal from parsed parts reproduces the same bytes
        let mut writer = PackfileWriter::new();
        for record in &packfile.index {
            let blob = packfile.get_blob(&record.mac).unwrap().to_vec();
            writer.add_blob(record.resource, record.version, record.mac, &blob, record.flags);
        }
        let (resealed, _) = writer.seal(&hasher, packfile.footer.timestamp);
        assert_eq!(resealed, data);
        Ok(())
    }

    #[test]
    fn index_corruption_is_detected() {
        let hasher = MacHasher::plain();
        let (mut data, _) = sample_packfile(&hasher);

        // flip one byte inside the serialized index
        let index_start = data.len() - FOOTER_SIZE - 3 * BLOB_RECORD_SIZE;
        data[index_start + 8] ^= 0x01;

        let err = Packfile::parse(&hasher, &data).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepositoryError>(),
            Some(RepositoryError::Integrity(_))
        ));
    }

    #[test]
    fn blob_bounds_are_enforced() {
        let hasher = MacHasher::plain();
        let mut writer = PackfileWriter::new();
        writer.add_blob(ResourceType::Chunk, 1, Mac::new([7; 32]), b"payload", 0);
        let raw_index_ok = serialize_index(&writer.index);

        // hand-craft a footer whose index claims a blob past the region
        let mut record = writer.index[0];
        record.length = 1000;
        let raw_index = serialize_index(&[record]);
        let footer = PackfileFooter {
            timestamp: 0,
            count: 1,
            index_offset: writer.blobs.len() as u64,
            index_mac: hasher.mac(&raw_index),
            flags: 0,
        };
        let mut data = writer.blobs.clone();
        data.extend_from_slice(&raw_index);
        data.extend_from_slice(&footer.serialize());

        let err = Packfile::parse(&hasher, &data).unwrap_err();
        assert!(err.to_string().contains("blob region"), "{err}");
        drop(raw_index_ok);
    }

    #[test]
    fn keyed_index_mac_requires_the_key() {
        let keyed = MacHasher::keyed([5u8; 32]);
        let (data, _) = sample_packfile(&keyed);
        assert!(Packfile::parse(&keyed, &data).is_ok());
        assert!(Packfile::parse(&MacHasher::plain(), &data).is_err());
    }
}
