//! Immutable state logs and their in-memory aggregation.
//!
//! A state blob describes the blob -> packfile location mappings produced
//! by one committed transaction, plus explicit deletion tombstones. The
//! repository merges every known state into an aggregate index; merging is
//! deterministic: records sort by `(blob_mac, serial)`, later serials win,
//! tombstones beat locations of the same serial.

use std::collections::HashMap;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use plakar_types::{Mac, ResourceType};

pub const STATE_VERSION: u32 = 1;

const RECORD_LOCATION: u8 = 0;
const RECORD_TOMBSTONE: u8 = 1;

const LOCATION_RECORD_SIZE: usize = 4 + 4 + 32 + 32 + 8 + 4 + 4;

/// Where one blob lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLocation {
    pub resource: ResourceType,
    pub version: u32,
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateRecord {
    Location { blob: Mac, location: BlobLocation },
    Tombstone { blob: Mac },
}

impl StateRecord {
    pub fn blob(&self) -> &Mac {
        match self {
            StateRecord::Location { blob, .. } => blob,
            StateRecord::Tombstone { blob } => blob,
        }
    }
}

#[derive(Clone, Debug)]
pub struct State {
    pub serial: u64,
    pub timestamp: i64,
    pub records: Vec<StateRecord>,
}

impl State {
    pub fn new(serial: u64, timestamp: i64, records: Vec<StateRecord>) -> Self {
        Self {
            serial,
            timestamp,
            records,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.records.len() * (1 + LOCATION_RECORD_SIZE));
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());

        for record in &self.records {
            match record {
                StateRecord::Location { blob, location } => {
                    out.push(RECORD_LOCATION);
                    out.extend_from_slice(&location.resource.as_u32().to_le_bytes());
                    out.extend_from_slice(&location.version.to_le_bytes());
                    out.extend_from_slice(blob.as_bytes());
                    out.extend_from_slice(location.packfile.as_bytes());
                    out.extend_from_slice(&location.offset.to_le_bytes());
                    out.extend_from_slice(&location.length.to_le_bytes());
                    out.extend_from_slice(&location.flags.to_le_bytes());
                }
                StateRecord::Tombstone { blob } => {
                    out.push(RECORD_TOMBSTONE);
                    out.extend_from_slice(blob.as_bytes());
                }
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 20 {
            bail!("state blob too short ({} bytes)", data.len());
        }
        let version = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if version != STATE_VERSION {
            bail!("unsupported state version {}", version);
        }
        let serial = u64::from_le_bytes(data[4..12].try_into().unwrap());
        let timestamp = i64::from_le_bytes(data[12..20].try_into().unwrap());

        let mut records = Vec::new();
        let mut rest = &data[20..];
        while !rest.is_empty() {
            match rest[0] {
                RECORD_LOCATION => {
                    if rest.len() < 1 + LOCATION_RECORD_SIZE {
                        bail!("truncated location record in state blob");
                    }
                    let raw = &rest[1..1 + LOCATION_RECORD_SIZE];
                    let resource =
                        ResourceType::from_u32(u32::from_le_bytes(raw[0..4].try_into().unwrap()))?;
                    records.push(StateRecord::Location {
                        blob: Mac::from_slice(&raw[8..40])?,
                        location: BlobLocation {
                            resource,
                            version: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
                            packfile: Mac::from_slice(&raw[40..72])?,
                            offset: u64::from_le_bytes(raw[72..80].try_into().unwrap()),
                            length: u32::from_le_bytes(raw[80..84].try_into().unwrap()),
                            flags: u32::from_le_bytes(raw[84..88].try_into().unwrap()),
                        },
                    });
                    rest = &rest[1 + LOCATION_RECORD_SIZE..];
                }
                RECORD_TOMBSTONE => {
                    if rest.len() < 1 + 32 {
                        bail!("truncated tombstone record in state blob");
                    }
                    records.push(StateRecord::Tombstone {
                        blob: Mac::from_slice(&rest[1..33])?,
                    });
                    rest = &rest[33..];
                }
                other => bail!("unknown state record kind {}", other),
            }
        }

        Ok(Self {
            serial,
            timestamp,
            records,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum AggregateEntry {
    Location { serial: u64, location: BlobLocation },
    Tombstone { serial: u64 },
}

impl AggregateEntry {
    fn serial(&self) -> u64 {
        match self {
            AggregateEntry::Location { serial, .. } => *serial,
            AggregateEntry::Tombstone { serial } => *serial,
        }
    }
}

/// Merge of all known states; the source of truth for resolve and dedup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AggregateState {
    entries: HashMap<Mac, AggregateEntry>,
    max_serial: u64,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_state(&mut self, state: &State) {
        if state.serial > self.max_serial {
            self.max_serial = state.serial;
        }
        for record in &state.records {
            self.apply_record(state.serial, record);
        }
    }

    fn apply_record(&mut self, serial: u64, record: &StateRecord) {
        let entry = match record {
            StateRecord::Location { location, .. } => AggregateEntry::Location {
                serial,
                location: *location,
            },
            StateRecord::Tombstone { .. } => AggregateEntry::Tombstone { serial },
        };

        match self.entries.get(record.blob()) {
            Some(existing) => {
                let replace = match (existing, &entry) {
                    // later serials override earlier ones
                    (old, new) if new.serial() > old.serial() => true,
                    // a tombstone wins a tie against a location
                    (AggregateEntry::Location { serial: old, .. }, AggregateEntry::Tombstone { serial: new }) => {
                        new >= old
                    }
                    _ => false,
                };
                if replace {
                    self.entries.insert(*record.blob(), entry);
                }
            }
            None => {
                self.entries.insert(*record.blob(), entry);
            }
        }
    }

    pub fn get(&self, mac: &Mac) -> Option<&BlobLocation> {
        match self.entries.get(mac) {
            Some(AggregateEntry::Location { location, .. }) => Some(location),
            _ => None,
        }
    }

    pub fn contains(&self, mac: &Mac) -> bool {
        self.get(mac).is_some()
    }

    pub fn is_tombstoned(&self, mac: &Mac) -> bool {
        matches!(self.entries.get(mac), Some(AggregateEntry::Tombstone { .. }))
    }

    pub fn max_serial(&self) -> u64 {
        self.max_serial
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate every live `(blob, location)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&Mac, &BlobLocation)> {
        self.entries.iter().filter_map(|(mac, entry)| match entry {
            AggregateEntry::Location { location, .. } => Some((mac, location)),
            AggregateEntry::Tombstone { .. } => None,
        })
    }

    /// MACs of every live blob of one resource type.
    pub fn list_resource(&self, resource: ResourceType) -> Vec<Mac> {
        let mut macs: Vec<Mac> = self
            .iter()
            .filter(|(_, location)| location.resource == resource)
            .map(|(mac, _)| *mac)
            .collect();
        macs.sort();
        macs
    }

    /// Live blobs grouped by containing packfile.
    pub fn blobs_by_packfile(&self) -> HashMap<Mac, Vec<Mac>> {
        let mut result: HashMap<Mac, Vec<Mac>> = HashMap::new();
        for (mac, location) in self.iter() {
            result.entry(location.packfile).or_default().push(*mac);
        }
        result
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn location(packfile: u8) -> BlobLocation {
        BlobLocation {
            resource: ResourceType::Chunk,
            version: 1,
            packfile: Mac::new([packfile; 32]),
            offset: 0,
            length: 10,
            flags: 0,
        }
    }

    #[test]
    fn serialization_round_trip() -> Result<(), Error> {
        let state = State::new(
            7,
            1700000000,
            vec![
                StateRecord::Location {
                    blob: Mac::new([1; 32]),
                    location: location(9),
                },
                StateRecord::Tombstone {
                    blob: Mac::new([2; 32]),
                },
            ],
        );
        let parsed = State::deserialize(&state.serialize())?;
        assert_eq!(parsed.serial, 7);
        assert_eq!(parsed.timestamp, 1700000000);
        assert_eq!(parsed.records, state.records);
        Ok(())
    }

    #[test]
    fn later_serial_wins() {
        let blob = Mac::new([1; 32]);
        let mut aggregate = AggregateState::new();
        aggregate.apply_state(&State::new(
            1,
            0,
            vec![StateRecord::Location { blob, location: location(1) }],
        ));
        aggregate.apply_state(&State::new(
            2,
            0,
            vec![StateRecord::Location { blob, location: location(2) }],
        ));
        assert_eq!(aggregate.get(&blob).unwrap().packfile, Mac::new([2; 32]));

        // an older state arriving late does not override
        aggregate.apply_state(&State::new(
            1,
            0,
            vec![StateRecord::Location { blob, location: location(1) }],
        ));
        assert_eq!(aggregate.get(&blob).unwrap().packfile, Mac::new([2; 32]));
    }

    #[test]
    fn tombstone_removes() {
        let blob = Mac::new([1; 32]);
        let mut aggregate = AggregateState::new();
        aggregate.apply_state(&State::new(
            1,
            0,
            vec![StateRecord::Location { blob, location: location(1) }],
        ));
        aggregate.apply_state(&State::new(2, 0, vec![StateRecord::Tombstone { blob }]));
        assert!(aggregate.get(&blob).is_none());
        assert!(aggregate.is_tombstoned(&blob));
    }

    #[test]
    fn merge_order_is_irrelevant_for_disjoint_sets() {
        let states: Vec<State> = (0u8..4)
            .map(|n| {
                State::new(
                    n as u64 + 1,
                    0,
                    vec![StateRecord::Location {
                        blob: Mac::new([n; 32]),
                        location: location(n),
                    }],
                )
            })
            .collect();

        let mut forward = AggregateState::new();
        for state in &states {
            forward.apply_state(state);
        }
        let mut backward = AggregateState::new();
        for state in states.iter().rev() {
            backward.apply_state(state);
        }

        for n in 0u8..4 {
            let mac = Mac::new([n; 32]);
            assert_eq!(forward.get(&mac), backward.get(&mac));
        }
        assert_eq!(forward.len(), backward.len());
    }

    #[test]
    fn cache_round_trip() -> Result<(), Error> {
        let mut aggregate = AggregateState::new();
        aggregate.apply_state(&State::new(
            3,
            0,
            vec![StateRecord::Location {
                blob: Mac::new([1; 32]),
                location: location(1),
            }],
        ));
        let restored = AggregateState::deserialize(&aggregate.serialize()?)?;
        assert_eq!(restored.max_serial(), 3);
        assert_eq!(restored.get(&Mac::new([1; 32])), aggregate.get(&Mac::new([1; 32])));
        Ok(())
    }
}
