// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::fmt;

/// Byte-length coordinates of one appended unit in the compressed stream.
///
/// Both lengths are the literal counts produced and consumed by a single `append`
/// call. Summing `compressed_length` over consecutive chunks gives their offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCoordinates {
    pub compressed_length: u32,
    pub uncompressed_length: u32,
}

/// A chunk together with the absolute file offset at which its compressed bytes
/// start. The offset is taken under the same lock as the write, so it stays correct
/// when several threads append concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedChunk {
    pub offset: u64,
    pub coordinates: ChunkCoordinates,
}

/// Location of one stored row, one per variant A with at least one partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub variant_index: u32,
    /// Absolute offset of the row chunk in the file.
    pub file_offset: u64,
    pub compressed_length: u32,
    pub uncompressed_length: u32,
    pub row_count: u32,
}

impl IndexEntry {
    /// The exclusive end offset of the row chunk.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.file_offset.saturating_add(u64::from(self.compressed_length))
    }
}

/// One decoded `(variant B, r2)` pair of a stored row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct R2 {
    pub variant_b: u32,
    pub r2: f32,
}

impl fmt::Display for R2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.variant_b, self.r2)
    }
}
