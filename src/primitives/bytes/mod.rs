#![forbid(unsafe_code)]
//! Order-preserving key encoders shared by the row and column layouts.

pub mod ord {
    //! Big-endian encoders so byte order matches numeric order.

    use crate::types::{PenumbraError, Result};

    const U64_LEN: usize = core::mem::size_of::<u64>();
    const LEN_LEN: usize = core::mem::size_of::<u32>();

    /// Appends `v` in big-endian order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian u64 from the head of `src`.
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head: [u8; U64_LEN] = src
            .get(..U64_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                PenumbraError::Serialization(format!(
                    "u64 source shorter than 8 bytes (have {})",
                    src.len()
                ))
            })?;
        Ok(u64::from_be_bytes(head))
    }

    /// Appends a length-prefixed byte string.
    pub fn put_bytes_key(dst: &mut Vec<u8>, bytes: &[u8]) {
        dst.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        dst.extend_from_slice(bytes);
    }

    /// Splits a length-prefixed byte string, returning it and the bytes consumed.
    pub fn split_bytes_key(src: &[u8]) -> Result<(&[u8], usize)> {
        let prefix: [u8; LEN_LEN] = src
            .get(..LEN_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                PenumbraError::Serialization("byte key shorter than length prefix".into())
            })?;
        let len = u32::from_be_bytes(prefix) as usize;
        let end = LEN_LEN + len;
        let body = src
            .get(LEN_LEN..end)
            .ok_or_else(|| PenumbraError::Serialization("byte key truncated".into()))?;
        Ok((body, end))
    }

    /// Smallest byte string greater than every string starting with `prefix`.
    ///
    /// Returns `None` when no such bound exists (empty or all-`0xFF` prefix).
    pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < u8::MAX {
                end.push(last + 1);
                return Some(end);
            }
        }
        None
    }
}
