// On-disk layout of an LD matrix file. All integers are little-endian.
//
//   [0, 10)                 gzip-style header
//   [10, rows_end)          row chunks, one per stored row
//   [rows_end, index_off)   variant-table chunk
//   [index_off, footer_off) index records, INDEX_ENTRY_LEN bytes each
//   [footer_off, len - 8)   footer, FOOTER_LEN bytes
//   [len - 8, len)          trailer: crc32, total uncompressed length mod 2^32

use crate::error::{LdError, Result};
use crate::gz::{GZIP_HEADER, GZIP_HEADER_LEN, GZIP_TRAILER_LEN};
use crate::types::{IndexEntry, R2};

pub const FILE_EXTENSION: &str = "tld";
pub const FOOTER_MAGIC: [u8; 8] = *b"TLDINDEX";
pub const FORMAT_VERSION: u32 = 1;

pub const INDEX_ENTRY_LEN: usize = 24;
pub const FOOTER_LEN: usize = 56;
/// Bytes per `(i32 variant B, f32 r2)` pair in a decompressed row.
pub const PAIR_LEN: usize = 8;

/// The smallest file that can hold a header, a footer and a trailer.
pub const MIN_FILE_LEN: u64 = GZIP_HEADER_LEN + FOOTER_LEN as u64 + GZIP_TRAILER_LEN;

pub fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < GZIP_HEADER.len() || bytes[..GZIP_HEADER.len()] != GZIP_HEADER {
        return Err(LdError::Format(
            "Missing gzip-style header; not an LD matrix file.".to_string(),
        ));
    }
    Ok(())
}

pub fn encode_entry(entry: &IndexEntry, out: &mut Vec<u8>) {
    out.extend_from_slice(&entry.variant_index.to_le_bytes());
    out.extend_from_slice(&entry.file_offset.to_le_bytes());
    out.extend_from_slice(&entry.compressed_length.to_le_bytes());
    out.extend_from_slice(&entry.uncompressed_length.to_le_bytes());
    out.extend_from_slice(&entry.row_count.to_le_bytes());
}

pub fn decode_entry(record: &[u8; INDEX_ENTRY_LEN]) -> IndexEntry {
    IndexEntry {
        variant_index: le_u32(record, 0),
        file_offset: le_u64(record, 4),
        compressed_length: le_u32(record, 12),
        uncompressed_length: le_u32(record, 16),
        row_count: le_u32(record, 20),
    }
}

/// Fixed-width locator for the index section and the variant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub entry_count: u64,
    pub variants_offset: u64,
    pub variants_compressed_length: u32,
    pub variants_uncompressed_length: u32,
    pub variant_count: u32,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut out = [0u8; FOOTER_LEN];
        out[0..8].copy_from_slice(&FOOTER_MAGIC);
        out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[12..16].copy_from_slice(&(INDEX_ENTRY_LEN as u32).to_le_bytes());
        out[16..24].copy_from_slice(&self.index_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        out[32..40].copy_from_slice(&self.variants_offset.to_le_bytes());
        out[40..44].copy_from_slice(&self.variants_compressed_length.to_le_bytes());
        out[44..48].copy_from_slice(&self.variants_uncompressed_length.to_le_bytes());
        out[48..52].copy_from_slice(&self.variant_count.to_le_bytes());
        // [52, 56) reserved, zero.
        out
    }

    pub fn decode(bytes: &[u8; FOOTER_LEN]) -> Result<Self> {
        if bytes[0..8] != FOOTER_MAGIC {
            return Err(LdError::Format("Footer magic not found.".to_string()));
        }
        let version = le_u32(bytes, 8);
        if version != FORMAT_VERSION {
            return Err(LdError::Format(format!(
                "Unsupported format version {version} (expected {FORMAT_VERSION})."
            )));
        }
        let entry_width = le_u32(bytes, 12);
        if entry_width as usize != INDEX_ENTRY_LEN {
            return Err(LdError::Format(format!(
                "Unsupported index record width {entry_width} (expected {INDEX_ENTRY_LEN})."
            )));
        }
        Ok(Self {
            index_offset: le_u64(bytes, 16),
            entry_count: le_u64(bytes, 24),
            variants_offset: le_u64(bytes, 32),
            variants_compressed_length: le_u32(bytes, 40),
            variants_uncompressed_length: le_u32(bytes, 44),
            variant_count: le_u32(bytes, 48),
        })
    }

    /// Checks the footer against the length of the file it was read from.
    pub fn validate(&self, file_len: u64) -> Result<()> {
        let footer_offset = file_len.saturating_sub(GZIP_TRAILER_LEN + FOOTER_LEN as u64);
        let index_len = self
            .entry_count
            .checked_mul(INDEX_ENTRY_LEN as u64)
            .ok_or_else(|| LdError::Format("Index entry count overflows.".to_string()))?;
        if self.index_offset < GZIP_HEADER_LEN
            || self.index_offset.checked_add(index_len) != Some(footer_offset)
        {
            return Err(LdError::Format(format!(
                "Index section [{}, +{index_len}) does not end at the footer ({footer_offset}).",
                self.index_offset
            )));
        }
        let variants_end = self
            .variants_offset
            .saturating_add(u64::from(self.variants_compressed_length));
        if self.variants_offset < GZIP_HEADER_LEN || variants_end != self.index_offset {
            return Err(LdError::Format(format!(
                "Variant table [{}, {variants_end}) does not end at the index ({}).",
                self.variants_offset, self.index_offset
            )));
        }
        Ok(())
    }
}

/// Serializes a row as consecutive `(i32, f32)` pairs in list order.
pub fn encode_row(variant_b: &[u32], r2: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(variant_b.len() * PAIR_LEN);
    for (b, value) in variant_b.iter().zip(r2) {
        out.extend_from_slice(&(*b as i32).to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_row(bytes: &[u8], row_count: u32) -> Result<Vec<R2>> {
    if bytes.len() != row_count as usize * PAIR_LEN {
        return Err(LdError::Format(format!(
            "Row holds {} bytes but its index entry declares {row_count} pairs.",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(PAIR_LEN)
        .map(|pair| {
            let b = i32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let variant_b = u32::try_from(b).map_err(|_| {
                LdError::Format(format!("Negative variant index {b} in a stored row."))
            })?;
            Ok(R2 {
                variant_b,
                r2: f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]),
            })
        })
        .collect()
}

#[inline]
fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
