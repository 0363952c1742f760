use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// 32 byte message authentication code.
///
/// Doubles as the content address of every persistent artefact. When the
/// repository is encrypted the tag is keyed with the master key, otherwise
/// it is a plain SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mac(pub [u8; 32]);

impl Mac {
    pub const SIZE: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 32 {
            bail!("wrong MAC length ({} bytes)", data.len());
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(data);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First byte rendered as two lowercase hex chars, used to bucket
    /// filesystem namespaces.
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Short form for log messages and listings.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Mac({})", hex::encode(self.0))
    }
}

impl FromStr for Mac {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s)
            .map_err(|err| format_err!("invalid MAC '{}' - {}", s, err))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let mac = Mac::new([0xab; 32]);
        let text = mac.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Mac>().unwrap(), mac);
        assert_eq!(mac.prefix(), "ab");
    }

    #[test]
    fn rejects_bad_input() {
        assert!("zz".parse::<Mac>().is_err());
        assert!("abcd".parse::<Mac>().is_err());
        assert!(Mac::from_slice(&[0u8; 16]).is_err());
    }
}
