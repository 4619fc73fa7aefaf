// ========================================================================================
//
//                              THE LD MATRIX READER
//
// ========================================================================================
//
// ### Purpose ###
//
// Answers "r2 of variant X against its stored partners" from a closed matrix file
// without scanning it. Opening reads the footer, loads the index section into a hash
// map keyed by variant A and rebuilds the variant table. The chunk region is then
// mapped as fixed-size blocks; a query locates its row through the index, copies the
// compressed bytes out under the block locks and inflates them after the locks are
// released.
//
// ### Asymmetry ###
//
// Only rows that were written for a variant A are found. A variant that only ever
// appeared as a partner B has no row of its own, and querying it yields no data.

use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::{LdError, Result};
use crate::gz::{self, GZIP_HEADER_LEN, GZIP_TRAILER_LEN};
use crate::ld::format::{self, FOOTER_LEN, Footer, INDEX_ENTRY_LEN, MIN_FILE_LEN, PAIR_LEN};
use crate::mapped::BlockMappedFile;
use crate::types::{IndexEntry, R2};
use crate::variant_index::VariantIndex;
use ahash::AHashMap;
use rayon::prelude::*;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The partners of one variant, keyed by partner id.
pub type R2Map = AHashMap<String, f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Bytes per memory-mapped block.
    pub block_size: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixSummary {
    pub variants: u64,
    pub rows: u64,
    pub pairs: u64,
    pub file_len: u64,
    /// Bytes of compressed chunks, variant table included.
    pub chunk_bytes: u64,
    pub block_size: u64,
    pub blocks: usize,
}

impl fmt::Display for MatrixSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "variants\t{}", self.variants)?;
        writeln!(f, "rows\t{}", self.rows)?;
        writeln!(f, "pairs\t{}", self.pairs)?;
        writeln!(f, "file_bytes\t{}", self.file_len)?;
        writeln!(f, "chunk_bytes\t{}", self.chunk_bytes)?;
        write!(f, "blocks\t{} x {} bytes", self.blocks, self.block_size)
    }
}

pub struct LdMatrixReader {
    path: PathBuf,
    file_len: u64,
    footer: Footer,
    variant_index: Arc<VariantIndex>,
    entries: AHashMap<u32, IndexEntry>,
    mapped: BlockMappedFile,
}

impl fmt::Debug for LdMatrixReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdMatrixReader")
            .field("path", &self.path)
            .field("rows", &self.entries.len())
            .field("variants", &self.variant_index.len())
            .finish()
    }
}

impl LdMatrixReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    /// Opens a matrix written by `LdMatrixWriter`.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Format` if it is not a complete matrix file
    /// or its index is inconsistent, `Compression` if the variant table is corrupt.
    pub fn open_with(path: &Path, options: ReaderOptions) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < MIN_FILE_LEN {
            return Err(LdError::Format(format!(
                "'{}' is {file_len} bytes, shorter than any LD matrix file.",
                path.display()
            )));
        }

        let mut header = [0u8; GZIP_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        format::check_header(&header)?;

        let mut raw_footer = [0u8; FOOTER_LEN];
        file.seek(SeekFrom::Start(
            file_len - GZIP_TRAILER_LEN - FOOTER_LEN as u64,
        ))?;
        file.read_exact(&mut raw_footer)?;
        let footer = Footer::decode(&raw_footer)?;
        footer.validate(file_len)?;

        let entries = read_index(&mut file, &footer)?;

        let mapped = BlockMappedFile::open(
            &file,
            GZIP_HEADER_LEN,
            footer.index_offset - GZIP_HEADER_LEN,
            options.block_size,
        )?;

        let table = read_chunk(
            &mapped,
            footer.variants_offset,
            footer.variants_compressed_length,
            footer.variants_uncompressed_length,
        )?;
        let variant_index = VariantIndex::decode(&table)?;
        if variant_index.len() != footer.variant_count as usize {
            return Err(LdError::Format(format!(
                "Variant table holds {} ids but the footer declares {}.",
                variant_index.len(),
                footer.variant_count
            )));
        }
        if let Some(entry) = entries
            .values()
            .find(|entry| entry.variant_index >= footer.variant_count)
        {
            return Err(LdError::Format(format!(
                "Index entry refers to variant {} outside the variant table.",
                entry.variant_index
            )));
        }

        log::info!(
            "Opened LD matrix '{}': {} rows over {} variants",
            path.display(),
            entries.len(),
            variant_index.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file_len,
            footer,
            variant_index: Arc::new(variant_index),
            entries,
            mapped,
        })
    }

    /// The variant table persisted with the matrix.
    pub fn variant_index(&self) -> &Arc<VariantIndex> {
        &self.variant_index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains_row(&self, variant_a: u32) -> bool {
        self.entries.contains_key(&variant_a)
    }

    /// The stored row of `variant_a` in write order, or `None` if it has no row.
    pub fn get_row(&self, variant_a: u32) -> Result<Option<Vec<R2>>> {
        let Some(entry) = self.entries.get(&variant_a) else {
            return Ok(None);
        };
        let bytes = read_chunk(
            &self.mapped,
            entry.file_offset,
            entry.compressed_length,
            entry.uncompressed_length,
        )?;
        format::decode_row(&bytes, entry.row_count).map(Some)
    }

    /// The partners of `variant_id`, or `None` if it is known but has no row.
    ///
    /// # Errors
    /// `UnknownVariant` if the id is not in the variant table.
    pub fn get_r2(&self, variant_id: &str) -> Result<Option<R2Map>> {
        let variant_a = self.variant_index.get_index(variant_id)?;
        let Some(row) = self.get_row(variant_a)? else {
            return Ok(None);
        };
        let mut partners = AHashMap::with_capacity(row.len());
        for pair in row {
            let id = self.variant_index.get_id(pair.variant_b).map_err(|_| {
                LdError::Format(format!(
                    "Row of '{variant_id}' refers to unknown variant index {}.",
                    pair.variant_b
                ))
            })?;
            partners.insert(id.to_string(), pair.r2);
        }
        Ok(Some(partners))
    }

    /// Like [`LdMatrixReader::get_r2`], treating an unknown id as "no data".
    pub fn lookup_r2(&self, variant_id: &str) -> Result<Option<R2Map>> {
        match self.get_r2(variant_id) {
            Err(e) if e.is_recoverable() => Ok(None),
            other => other,
        }
    }

    /// Looks up many variants in parallel. Results follow the order of `variant_ids`.
    pub fn par_lookup<S>(&self, variant_ids: &[S]) -> Result<Vec<Option<R2Map>>>
    where
        S: AsRef<str> + Sync,
    {
        variant_ids
            .par_iter()
            .map(|id| self.lookup_r2(id.as_ref()))
            .collect()
    }

    pub fn summary(&self) -> MatrixSummary {
        MatrixSummary {
            variants: u64::from(self.footer.variant_count),
            rows: self.entries.len() as u64,
            pairs: self
                .entries
                .values()
                .map(|entry| u64::from(entry.row_count))
                .sum(),
            file_len: self.file_len,
            chunk_bytes: self.mapped.section_len(),
            block_size: self.mapped.block_size(),
            blocks: self.mapped.block_count(),
        }
    }

    /// Inflates every chunk and checks them against the trailer.
    ///
    /// The row chunks, in offset order, followed by the variant table must tile the
    /// chunk region exactly, and the CRC-32 and length of their uncompressed bytes
    /// must equal the trailer.
    pub fn verify(&self) -> Result<()> {
        let mut rows: Vec<&IndexEntry> = self.entries.values().collect();
        rows.sort_unstable_by_key(|entry| entry.file_offset);

        let mut crc = flate2::Crc::new();
        let mut expected = GZIP_HEADER_LEN;
        for entry in rows {
            if entry.file_offset != expected {
                return Err(LdError::Format(format!(
                    "Row of variant {} starts at {} but the previous chunk ends at {expected}.",
                    entry.variant_index, entry.file_offset
                )));
            }
            let bytes = read_chunk(
                &self.mapped,
                entry.file_offset,
                entry.compressed_length,
                entry.uncompressed_length,
            )?;
            crc.update(&bytes);
            expected = entry.end_offset();
        }
        if self.footer.variants_offset != expected {
            return Err(LdError::Format(format!(
                "Variant table starts at {} but the last row ends at {expected}.",
                self.footer.variants_offset
            )));
        }
        let table = read_chunk(
            &self.mapped,
            self.footer.variants_offset,
            self.footer.variants_compressed_length,
            self.footer.variants_uncompressed_length,
        )?;
        crc.update(&table);

        let mut trailer = [0u8; GZIP_TRAILER_LEN as usize];
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.file_len - GZIP_TRAILER_LEN))?;
        file.read_exact(&mut trailer)?;
        let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let stored_len = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        if stored_crc != crc.sum() || stored_len != crc.amount() {
            return Err(LdError::Format(format!(
                "Trailer (crc {stored_crc:08x}, {stored_len} bytes) does not match the chunks \
                 (crc {:08x}, {} bytes).",
                crc.sum(),
                crc.amount()
            )));
        }
        log::info!("Verified LD matrix '{}'", self.path.display());
        Ok(())
    }

    /// Unmaps the file.
    pub fn close(self) {
        log::debug!("Closing LD matrix '{}'", self.path.display());
        self.mapped.close();
    }
}

fn read_index(file: &mut File, footer: &Footer) -> Result<AHashMap<u32, IndexEntry>> {
    let mut raw = vec![0u8; footer.entry_count as usize * INDEX_ENTRY_LEN];
    file.seek(SeekFrom::Start(footer.index_offset))?;
    file.read_exact(&mut raw)?;

    let mut entries = AHashMap::with_capacity(footer.entry_count as usize);
    for record in raw.chunks_exact(INDEX_ENTRY_LEN) {
        let mut fixed = [0u8; INDEX_ENTRY_LEN];
        fixed.copy_from_slice(record);
        let entry = format::decode_entry(&fixed);

        if entry.row_count == 0
            || entry.uncompressed_length as usize != entry.row_count as usize * PAIR_LEN
        {
            return Err(LdError::Format(format!(
                "Index entry for variant {} declares {} pairs in {} bytes.",
                entry.variant_index, entry.row_count, entry.uncompressed_length
            )));
        }
        if entry.file_offset < GZIP_HEADER_LEN || entry.end_offset() > footer.variants_offset {
            return Err(LdError::Format(format!(
                "Row of variant {} lies outside the row region.",
                entry.variant_index
            )));
        }
        if entries.insert(entry.variant_index, entry).is_some() {
            return Err(LdError::Format(format!(
                "Variant {} has more than one index entry.",
                entry.variant_index
            )));
        }
    }
    Ok(entries)
}

/// Copies a chunk out of the mapped region and inflates it once the block locks are
/// released. `file_offset` is absolute.
fn read_chunk(
    mapped: &BlockMappedFile,
    file_offset: u64,
    compressed_length: u32,
    uncompressed_length: u32,
) -> Result<Vec<u8>> {
    let compressed = {
        let mut cursor = mapped.open_cursor(file_offset - GZIP_HEADER_LEN)?;
        cursor.read_bytes(compressed_length as usize)?
    };
    gz::inflate_chunk(&compressed, uncompressed_length as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ld::writer::LdMatrixWriter;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    #[test]
    fn rows_come_back_in_write_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.tld");
        let index = Arc::new(VariantIndex::from_ids(["a", "b", "c", "d"]).unwrap());
        let writer = LdMatrixWriter::open(Arc::clone(&index), &path, 9).unwrap();
        writer.add_variant(2, &[3, 0, 1], &[0.3, 0.1, 0.2]).unwrap();
        writer.add_variant(0, &[2], &[0.7]).unwrap();
        writer.close().unwrap();

        let reader = LdMatrixReader::open_with(&path, ReaderOptions { block_size: 3 }).unwrap();
        let row = reader.get_row(2).unwrap().unwrap();
        let partners: Vec<u32> = row.iter().map(|pair| pair.variant_b).collect();
        assert_eq!(partners, vec![3, 0, 1]);
        assert!(reader.get_row(1).unwrap().is_none());

        let r2 = reader.get_r2("a").unwrap().unwrap();
        assert_relative_eq!(r2.get("c").copied().unwrap(), 0.7);
        assert!(reader.get_r2("b").unwrap().is_none());
        assert!(matches!(reader.get_r2("zzz"), Err(LdError::UnknownVariant(_))));
        assert!(reader.lookup_r2("zzz").unwrap().is_none());

        let summary = reader.summary();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.pairs, 4);
        assert_eq!(summary.variants, 4);
        reader.verify().unwrap();
        reader.close();
    }

    #[test]
    fn empty_matrix_opens_and_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.tld");
        let writer = LdMatrixWriter::open(Arc::new(VariantIndex::new()), &path, 1).unwrap();
        writer.close().unwrap();

        let reader = LdMatrixReader::open(&path).unwrap();
        assert_eq!(reader.summary().rows, 0);
        assert!(reader.lookup_r2("DUMMY").unwrap().is_none());
        reader.verify().unwrap();
    }

    #[test]
    fn truncated_and_foreign_files_are_format_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.tld");
        let index = Arc::new(VariantIndex::from_ids(["a", "b"]).unwrap());
        let writer = LdMatrixWriter::open(index, &path, 9).unwrap();
        writer.add_variant(0, &[1], &[0.5]).unwrap();
        writer.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let truncated = dir.path().join("truncated.tld");
        std::fs::write(&truncated, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            LdMatrixReader::open(&truncated),
            Err(LdError::Format(_))
        ));

        let foreign = dir.path().join("foreign.tld");
        std::fs::write(&foreign, vec![b'#'; 200]).unwrap();
        assert!(matches!(
            LdMatrixReader::open(&foreign),
            Err(LdError::Format(_))
        ));

        assert!(matches!(
            LdMatrixReader::open(&dir.path().join("missing.tld")),
            Err(LdError::Io(_))
        ));
    }

    #[test]
    fn verify_detects_a_corrupted_trailer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.tld");
        let index = Arc::new(VariantIndex::from_ids(["a", "b"]).unwrap());
        let writer = LdMatrixWriter::open(index, &path, 9).unwrap();
        writer.add_variant(1, &[0], &[0.5]).unwrap();
        writer.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reader = LdMatrixReader::open(&path).unwrap();
        assert!(reader.get_r2("b").unwrap().is_some());
        assert!(matches!(reader.verify(), Err(LdError::Format(_))));
    }
}
