//! Caller-supplied vertex ids and vertex row keys.
//!
//! Numeric vertex rows are keyed by the 8-byte big-endian row key from
//! [`IdManager::row_key`]. String ids are keyed by their ASCII bytes followed
//! by a zero terminator. A 7-byte string would then be exactly as long as a
//! numeric key, so it gets a second terminator; an 8-byte string is already 9
//! bytes long. Row keys of exactly 8 bytes are therefore always numeric.

use xxhash_rust::xxh64::xxh64;

use super::manager::IdManager;
use crate::types::{PartitionId, PenumbraError, Result, VertexId};

/// Length of a numeric row key.
pub const LONG_KEY_LEN: usize = 8;

const TERMINATOR: u8 = 0x00;

/// Separator reserved inside string ids.
pub const RESERVED_SEPARATOR: char = '-';

/// Checks a caller-supplied string id.
pub fn validate_string_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PenumbraError::InvalidId("Custom string id must not be empty".into()));
    }
    if !id.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(PenumbraError::InvalidId(format!(
            "Custom string id contains non-ascii or non-printable character: {id}"
        )));
    }
    if id.contains(RESERVED_SEPARATOR) {
        return Err(PenumbraError::InvalidId(format!(
            "Custom string id contains reserved string ({RESERVED_SEPARATOR}): {id}"
        )));
    }
    Ok(())
}

/// Row key bytes of a string id.
pub fn encode_string_key(id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(id.len() + 2);
    key.extend_from_slice(id.as_bytes());
    key.push(TERMINATOR);
    if key.len() == LONG_KEY_LEN {
        key.push(TERMINATOR);
    }
    key
}

/// Row key of any vertex.
pub fn vertex_row_key(ids: &IdManager, vertex: &VertexId) -> Result<Vec<u8>> {
    match vertex {
        VertexId::Long(id) => Ok(ids.row_key(*id)?.to_be_bytes().to_vec()),
        VertexId::Str(s) => {
            validate_string_id(s)?;
            Ok(encode_string_key(s))
        }
    }
}

/// Inverse of [`vertex_row_key`].
pub fn vertex_from_row_key(ids: &IdManager, key: &[u8]) -> Result<VertexId> {
    if key.len() == LONG_KEY_LEN {
        let mut buf = [0u8; LONG_KEY_LEN];
        buf.copy_from_slice(key);
        return Ok(VertexId::Long(ids.id_from_row_key(u64::from_be_bytes(buf))?));
    }
    let end = key
        .iter()
        .position(|b| *b == TERMINATOR)
        .ok_or_else(|| PenumbraError::Serialization("string row key without terminator".into()))?;
    if key[end..].iter().any(|b| *b != TERMINATOR) {
        return Err(PenumbraError::Serialization("string row key with trailing bytes".into()));
    }
    let s = std::str::from_utf8(&key[..end])
        .map_err(|e| PenumbraError::Serialization(format!("string row key: {e}")))?;
    Ok(VertexId::Str(s.to_owned()))
}

/// Partition a string id is stored under.
pub fn string_partition(ids: &IdManager, id: &str) -> PartitionId {
    PartitionId(ids.partition_hash(xxh64(id.as_bytes(), 0)))
}

/// Partition of any vertex.
pub fn vertex_partition(ids: &IdManager, vertex: &VertexId) -> Result<PartitionId> {
    match vertex {
        VertexId::Long(id) => ids.partition_of(*id),
        VertexId::Str(s) => Ok(string_partition(ids, s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ids::manager::IdKind;

    #[test]
    fn rejects_bad_strings_with_original_messages() {
        let err = validate_string_id("a-b").unwrap_err();
        assert!(err
            .to_string()
            .contains("Custom string id contains reserved string (-): a-b"));
        let err = validate_string_id("caf\u{e9}").unwrap_err();
        assert!(err.to_string().contains("non-ascii or non-printable"));
        assert!(validate_string_id("tab\there").is_err());
        assert!(validate_string_id("").is_err());
        assert!(validate_string_id("ok id_1").is_ok());
    }

    #[test]
    fn seven_and_eight_byte_strings_never_alias_numeric_keys() -> Result<()> {
        let ids = IdManager::new(5, true)?;
        for s in ["abcdefg", "abcdefgh", "1234567", "12345678"] {
            let key = vertex_row_key(&ids, &VertexId::Str(s.into()))?;
            assert_ne!(key.len(), LONG_KEY_LEN, "{s}");
            assert_eq!(vertex_from_row_key(&ids, &key)?, VertexId::Str(s.into()));
        }
        let seven = encode_string_key("abcdefg");
        let eight = encode_string_key("abcdefgh");
        assert_eq!(seven.len(), eight.len());
        assert_ne!(seven, eight);
        Ok(())
    }

    #[test]
    fn numeric_keys_decode_as_numbers() -> Result<()> {
        let ids = IdManager::new(5, false)?;
        let id = ids.vertex_id(IdKind::NormalVertex, 3, PartitionId(4))?;
        let key = vertex_row_key(&ids, &VertexId::Long(id))?;
        assert_eq!(key.len(), LONG_KEY_LEN);
        assert_eq!(vertex_from_row_key(&ids, &key)?, VertexId::Long(id));
        Ok(())
    }

    #[test]
    fn string_partitions_are_stable_and_bounded() -> Result<()> {
        let ids = IdManager::new(4, true)?;
        let p = string_partition(&ids, "user42");
        assert_eq!(p, string_partition(&ids, "user42"));
        assert!(p.0 < 16);
        Ok(())
    }
}
