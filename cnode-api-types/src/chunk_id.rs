use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Object type tag encoded in the high byte of every [`ChunkId`].
///
/// The tag is authoritative: it must be extractable from the id alone,
/// without consulting the registry or any on-disk metadata, because it
/// drives branch selection (session variant, GC eligibility, artifact
/// validation) throughout the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum EObjectType {
    Blob = 1,
    Erasure = 2,
    Journal = 3,
    Artifact = 4,
}

impl EObjectType {
    pub fn from_tag(tag: u8) -> Result<Self, Error> {
        Ok(match tag {
            1 => EObjectType::Blob,
            2 => EObjectType::Erasure,
            3 => EObjectType::Journal,
            4 => EObjectType::Artifact,
            other => bail!("unknown chunk object-type tag 0x{other:02x}"),
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Only journal chunks may be read while their owning session is active.
    pub fn readable_while_active(self) -> bool {
        matches!(self, EObjectType::Journal)
    }
}

/// 128-bit opaque chunk identifier.
///
/// The top byte carries the [`EObjectType`] tag (see module docs); the
/// remaining 15 bytes are random/content-derived. Two chunk ids are equal
/// iff their full 16 bytes match.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ChunkId {
    bytes: [u8; 16],
}

impl ChunkId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    pub fn new_random(object_type: EObjectType) -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[1..]);
        bytes[0] = object_type.tag();
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub fn object_type(&self) -> Result<EObjectType, Error> {
        EObjectType::from_tag(self.bytes[0])
    }

    /// Two-hex-nibble shard prefix used to bucket chunks into location
    /// subdirectories (`<root>/<xx>/<chunkId>`).
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.bytes[1])
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let decoded = hex::decode(s).map_err(|err| anyhow::format_err!("invalid chunk id: {err}"))?;
        if decoded.len() != 16 {
            bail!("invalid chunk id length: expected 16 bytes, got {}", decoded.len());
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_round_trips_through_display() {
        let id = ChunkId::new_random(EObjectType::Journal);
        let text = id.to_string();
        let parsed: ChunkId = text.parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(parsed.object_type().unwrap(), EObjectType::Journal);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("not-hex".parse::<ChunkId>().is_err());
        assert!("aa".parse::<ChunkId>().is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let id = ChunkId::from_bytes([0xff; 16]);
        assert!(id.object_type().is_err());
    }
}
