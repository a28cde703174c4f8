use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stasis_types::TypeToken;

use crate::error::{StoreError, StoreResult};
use crate::payload::{Payload, PayloadKind};

/// Format tag written by this version of the store.
pub const FORMAT_TAG: &str = "stasis-store/1";

/// Leading bytes of a binary container.
pub const BINARY_MAGIC: &[u8; 4] = b"STSB";

/// Current binary container version.
pub const BINARY_VERSION: u32 = 1;

/// Magic + version + CRC32.
const BINARY_HEADER_LEN: usize = 12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub token: TypeToken,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRecord {
    pub token: TypeToken,
    pub json: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRecord {
    pub token: TypeToken,
    pub bytes: Vec<u8>,
}

/// One committed database.
///
/// Records are split across three partitions by representation. Normally
/// only the configured backend's partition is populated; all three are
/// always present so a file can be read by a store with any backend.
///
/// Text containers are UTF-8 JSON. Binary containers are framed:
/// ```text
/// [4 bytes: magic "STSB"]
/// [4 bytes: version (big-endian u32)]
/// [4 bytes: CRC32 of body (big-endian u32)]
/// [N bytes: bincode body]
/// ```
/// bincode cannot read back untyped JSON trees, so a binary container
/// carries tree records in the boxed partition as JSON text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub format: String,
    pub build_tag: String,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub tree: BTreeMap<String, TreeRecord>,
    #[serde(default)]
    pub boxed: BTreeMap<String, TextRecord>,
    #[serde(default)]
    pub binary: BTreeMap<String, BinaryRecord>,
}

impl StoreSnapshot {
    /// An empty snapshot stamped now.
    pub fn empty(build_tag: impl Into<String>) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            build_tag: build_tag.into(),
            modified_at: Utc::now(),
            tree: BTreeMap::new(),
            boxed: BTreeMap::new(),
            binary: BTreeMap::new(),
        }
    }

    /// Partition in-memory records for writing.
    pub fn capture(
        records: &BTreeMap<String, Payload>,
        build_tag: &str,
        modified_at: DateTime<Utc>,
        binary_container: bool,
    ) -> StoreResult<Self> {
        let mut snapshot = Self::empty(build_tag);
        snapshot.modified_at = modified_at;

        for (key, payload) in records {
            let token = payload.token().clone();
            match payload.kind() {
                PayloadKind::Tree if !binary_container => {
                    if let Some(value) = payload.tree_value() {
                        snapshot.tree.insert(
                            key.clone(),
                            TreeRecord {
                                token,
                                value: value.clone(),
                            },
                        );
                    }
                }
                PayloadKind::Binary => {
                    if let Some(bytes) = payload.binary_bytes() {
                        snapshot.binary.insert(
                            key.clone(),
                            BinaryRecord {
                                token,
                                bytes: bytes.to_vec(),
                            },
                        );
                    }
                }
                _ => {
                    let json = payload.to_text().map_err(|e| StoreError::TypeMismatch {
                        key: key.clone(),
                        source: e,
                    })?;
                    snapshot.boxed.insert(key.clone(), TextRecord { token, json });
                }
            }
        }
        Ok(snapshot)
    }

    /// Turn the partitions back into payloads.
    pub fn into_records(self) -> BTreeMap<String, Payload> {
        let mut records = BTreeMap::new();
        for (key, record) in self.tree {
            records.insert(key, Payload::from_tree(record.token, record.value));
        }
        for (key, record) in self.boxed {
            records.insert(key, Payload::from_text(record.token, record.json));
        }
        for (key, record) in self.binary {
            records.insert(key, Payload::from_binary(record.token, record.bytes));
        }
        records
    }

    pub fn record_count(&self) -> usize {
        self.tree.len() + self.boxed.len() + self.binary.len()
    }

    /// Serialize as a binary or text container.
    pub fn encode(&self, binary_container: bool) -> StoreResult<Vec<u8>> {
        if !binary_container {
            return serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()));
        }
        if !self.tree.is_empty() {
            return Err(StoreError::Serialization(
                "tree records must be folded before binary encoding".into(),
            ));
        }
        let body = bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(BINARY_HEADER_LEN + body.len());
        out.extend_from_slice(BINARY_MAGIC);
        out.extend_from_slice(&BINARY_VERSION.to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a container, detecting binary or text by the magic.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        if !bytes.starts_with(BINARY_MAGIC) {
            return serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()));
        }
        if bytes.len() < BINARY_HEADER_LEN {
            return Err(StoreError::Corrupt(format!(
                "binary container truncated at {} bytes",
                bytes.len()
            )));
        }
        let version = u32::from_be_bytes(header_word(bytes, 4));
        if version != BINARY_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                expected: BINARY_VERSION,
            });
        }
        let stored_crc = u32::from_be_bytes(header_word(bytes, 8));
        let body = &bytes[BINARY_HEADER_LEN..];
        let computed = crc32fast::hash(body);
        if stored_crc != computed {
            return Err(StoreError::Corrupt(format!(
                "CRC mismatch: stored {stored_crc:08x}, computed {computed:08x}"
            )));
        }
        bincode::deserialize(body).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

fn header_word(bytes: &[u8], offset: usize) -> [u8; 4] {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> BTreeMap<String, Payload> {
        let mut records = BTreeMap::new();
        records.insert("gold".to_string(), Payload::tree(&250u32).unwrap());
        records.insert("name".to_string(), Payload::live(String::from("Ash")));
        records.insert("level".to_string(), Payload::binary(&7u8).unwrap());
        records
    }

    #[test]
    fn text_container_keeps_partitions() {
        let snap = StoreSnapshot::capture(&sample_records(), "b1", Utc::now(), false).unwrap();
        assert_eq!(snap.tree.len(), 1);
        assert_eq!(snap.boxed.len(), 1);
        assert_eq!(snap.binary.len(), 1);

        let bytes = snap.encode(false).unwrap();
        assert_eq!(bytes[0], b'{');
        let back = StoreSnapshot::decode(&bytes).unwrap();
        assert_eq!(back, snap);

        let records = back.into_records();
        assert_eq!(records["gold"].decode::<u32>().unwrap(), 250);
        assert_eq!(records["name"].decode::<String>().unwrap(), "Ash");
        assert_eq!(records["level"].decode::<u8>().unwrap(), 7);
    }

    #[test]
    fn binary_container_folds_tree_records() {
        let snap = StoreSnapshot::capture(&sample_records(), "b1", Utc::now(), true).unwrap();
        assert!(snap.tree.is_empty());
        assert_eq!(snap.boxed.len(), 2);

        let bytes = snap.encode(true).unwrap();
        assert_eq!(&bytes[..4], BINARY_MAGIC);
        let records = StoreSnapshot::decode(&bytes).unwrap().into_records();
        assert_eq!(records["gold"].decode::<u32>().unwrap(), 250);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn binary_crc_detects_corruption() {
        let snap = StoreSnapshot::capture(&sample_records(), "b1", Utc::now(), true).unwrap();
        let mut bytes = snap.encode(true).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        assert!(matches!(StoreSnapshot::decode(&bytes), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn binary_version_is_checked() {
        let mut bytes = StoreSnapshot::empty("b").encode(true).unwrap();
        bytes[4..8].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(
            StoreSnapshot::decode(&bytes),
            Err(StoreError::UnsupportedVersion { found: 9, expected: 1 })
        ));
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(matches!(
            StoreSnapshot::decode(b"not a container"),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            StoreSnapshot::decode(b"STSB\0\0"),
            Err(StoreError::Corrupt(_))
        ));
    }
}
