// ========================================================================================
//
//                               THE VARIANT INDEX
//
// ========================================================================================
//
// Assigns dense, zero-based integer ids to variant identifiers in first-seen order.
// Lookups by string go through a sharded concurrent map and never block each other;
// insertion of a previously unseen id takes the single write lock on the id table so
// the counter and both directions of the mapping move together.

use crate::error::{LdError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub struct VariantIndex {
    forward: DashMap<Arc<str>, u32, RandomState>,
    /// The reverse table. Its length is the authoritative id counter.
    ids: RwLock<Vec<Arc<str>>>,
}

impl Default for VariantIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VariantIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantIndex")
            .field("len", &self.len())
            .finish()
    }
}

impl VariantIndex {
    pub fn new() -> Self {
        Self {
            forward: DashMap::with_hasher(RandomState::new()),
            ids: RwLock::new(Vec::new()),
        }
    }

    /// Builds an index whose ids follow the order of `variants`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the same identifier appears twice, since that would
    /// break the one-to-one mapping between identifiers and integers.
    pub fn from_ids<I, S>(variants: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index = Self::new();
        for (expected, variant) in variants.into_iter().enumerate() {
            let variant = variant.as_ref();
            let assigned = index.add(variant);
            if assigned as usize != expected {
                return Err(LdError::InvalidArgument(format!(
                    "Duplicate variant identifier '{variant}' at position {expected}."
                )));
            }
        }
        Ok(index)
    }

    /// Returns the integer for `variant_id`, assigning the next free one if the
    /// identifier has not been seen before. Calling this twice with the same id
    /// returns the same integer.
    pub fn add(&self, variant_id: &str) -> u32 {
        if let Some(existing) = self.forward.get(variant_id) {
            return *existing;
        }

        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);

        // Another thread may have inserted it between the lookup and the lock.
        if let Some(existing) = self.forward.get(variant_id) {
            return *existing;
        }

        let index = ids.len() as u32;
        let key: Arc<str> = Arc::from(variant_id);
        ids.push(Arc::clone(&key));
        self.forward.insert(key, index);
        index
    }

    /// Returns the integer assigned to `variant_id`.
    ///
    /// # Errors
    /// Returns `UnknownVariant` if the identifier was never added.
    pub fn get_index(&self, variant_id: &str) -> Result<u32> {
        self.forward
            .get(variant_id)
            .map(|entry| *entry)
            .ok_or_else(|| LdError::UnknownVariant(variant_id.to_string()))
    }

    /// Returns the identifier assigned to `index`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if no identifier has been assigned this integer yet.
    pub fn get_id(&self, index: u32) -> Result<Arc<str>> {
        let ids = self.ids.read().unwrap_or_else(PoisonError::into_inner);
        ids.get(index as usize).cloned().ok_or_else(|| {
            LdError::InvalidArgument(format!(
                "Variant index {index} is out of range (index holds {} variants).",
                ids.len()
            ))
        })
    }

    pub fn contains(&self, variant_id: &str) -> bool {
        self.forward.contains_key(variant_id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of all identifiers, ordered by their integer.
    pub fn ids(&self) -> Vec<Arc<str>> {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Serializes the identifiers in integer order as `u32 count` followed by
    /// `(u32 byte length, UTF-8 bytes)` for each identifier, all little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let ids = self.ids.read().unwrap_or_else(PoisonError::into_inner);
        let payload: usize = ids.iter().map(|id| 4 + id.len()).sum();
        let mut buffer = Vec::with_capacity(4 + payload);
        buffer.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in ids.iter() {
            buffer.extend_from_slice(&(id.len() as u32).to_le_bytes());
            buffer.extend_from_slice(id.as_bytes());
        }
        buffer
    }

    /// Rebuilds an index from the bytes produced by [`VariantIndex::encode`].
    ///
    /// # Errors
    /// Returns `Format` for truncated input, trailing bytes, invalid UTF-8, or
    /// duplicated identifiers.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let count = read_u32(bytes, &mut cursor)? as usize;
        // Each identifier carries at least its 4-byte length prefix.
        let room = (bytes.len() - cursor) / 4;
        if count > room {
            return Err(LdError::Format(format!(
                "Variant table declares {count} identifiers but only {} bytes follow.",
                bytes.len() - cursor
            )));
        }
        let index = Self::new();
        {
            let mut ids = index.ids.write().unwrap_or_else(PoisonError::into_inner);
            ids.reserve(count);
            for position in 0..count {
                let length = read_u32(bytes, &mut cursor)? as usize;
                let end = cursor
                    .checked_add(length)
                    .filter(|end| *end <= bytes.len())
                    .ok_or_else(|| {
                        LdError::Format(format!(
                            "Variant table truncated while reading identifier {position} of {count}."
                        ))
                    })?;
                let id = std::str::from_utf8(&bytes[cursor..end]).map_err(|e| {
                    LdError::Format(format!("Variant identifier {position} is not UTF-8: {e}"))
                })?;
                cursor = end;

                let key: Arc<str> = Arc::from(id);
                if index.forward.insert(Arc::clone(&key), position as u32).is_some() {
                    return Err(LdError::Format(format!(
                        "Variant table lists '{id}' more than once."
                    )));
                }
                ids.push(key);
            }
        }
        if cursor != bytes.len() {
            return Err(LdError::Format(format!(
                "Variant table has {} unexpected trailing bytes.",
                bytes.len() - cursor
            )));
        }
        Ok(index)
    }
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    let raw: [u8; 4] = bytes
        .get(*cursor..end)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| LdError::Format("Variant table truncated.".to_string()))?;
    *cursor = end;
    Ok(u32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ids_are_assigned_in_first_seen_order() {
        let index = VariantIndex::new();
        assert_eq!(index.add("rs1"), 0);
        assert_eq!(index.add("rs2"), 1);
        assert_eq!(index.add("rs1"), 0);
        assert_eq!(index.add("rs3"), 2);
        assert_eq!(index.len(), 3);
        assert_eq!(&*index.get_id(1).unwrap(), "rs2");
        assert_eq!(index.get_index("rs3").unwrap(), 2);
    }

    #[test]
    fn unknown_lookups_fail() {
        let index = VariantIndex::new();
        index.add("rs1");
        assert!(matches!(
            index.get_index("DUMMY"),
            Err(LdError::UnknownVariant(id)) if id == "DUMMY"
        ));
        assert!(matches!(index.get_id(7), Err(LdError::InvalidArgument(_))));
    }

    #[test]
    fn from_ids_rejects_duplicates() {
        assert!(VariantIndex::from_ids(["a", "b", "c"]).is_ok());
        assert!(matches!(
            VariantIndex::from_ids(["a", "b", "a"]),
            Err(LdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn concurrent_adds_neither_lose_nor_duplicate_ids() {
        let index = Arc::new(VariantIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|thread_id| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    // Every thread walks the same ids in a different order.
                    for offset in 0..500 {
                        let value = (offset * 7 + thread_id * 13) % 500;
                        index.add(&format!("variant_{value}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.len(), 500);
        let ids = index.ids();
        for (position, id) in ids.iter().enumerate() {
            assert_eq!(index.get_index(id).unwrap() as usize, position);
        }
    }

    #[test]
    fn encoded_table_rebuilds_the_same_mapping() {
        let index = VariantIndex::from_ids(["1:100:A:G", "rs42", "", "ünïcode"]).unwrap();
        let decoded = VariantIndex::decode(&index.encode()).unwrap();
        assert_eq!(decoded.ids(), index.ids());
        assert_eq!(decoded.get_index("rs42").unwrap(), 1);
        assert_eq!(decoded.get_index("").unwrap(), 2);
    }

    #[test]
    fn decode_rejects_truncated_and_duplicated_tables() {
        let bytes = VariantIndex::from_ids(["a", "bb"]).unwrap().encode();
        assert!(matches!(
            VariantIndex::decode(&bytes[..bytes.len() - 1]),
            Err(LdError::Format(_))
        ));

        let mut duplicated = Vec::new();
        duplicated.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..2 {
            duplicated.extend_from_slice(&1u32.to_le_bytes());
            duplicated.push(b'x');
        }
        assert!(matches!(
            VariantIndex::decode(&duplicated),
            Err(LdError::Format(_))
        ));
    }

    #[test]
    fn decode_rejects_counts_larger_than_the_table() {
        assert!(matches!(
            VariantIndex::decode(&u32::MAX.to_le_bytes()),
            Err(LdError::Format(_))
        ));

        let mut oversized = Vec::new();
        oversized.extend_from_slice(&3u32.to_le_bytes());
        oversized.extend_from_slice(&0u32.to_le_bytes());
        oversized.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            VariantIndex::decode(&oversized),
            Err(LdError::Format(_))
        ));
    }
}
