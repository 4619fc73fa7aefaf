// ========================================================================================
//
//                              THE LD MATRIX WRITER
//
// ========================================================================================
//
// ### Purpose ###
//
// Persists a sparse LD matrix one row at a time. A row holds every `(B, r2)` partner
// of a single variant A and becomes one independently-flushed compressed chunk. The
// writer keeps an in-memory index entry per row and, on close, appends the variant
// table, the index section and the footer so a reader can find any row without
// scanning the file.
//
// `add_variant` may be called from many threads. Compression and the file write are
// serialized inside the chunked writer, which also reports the offset of each chunk
// under the same lock, so entries recorded concurrently are always exact.

use crate::error::{LdError, Result};
use crate::gz::ChunkedGzWriter;
use crate::ld::format::{self, Footer, INDEX_ENTRY_LEN};
use crate::types::IndexEntry;
use crate::variant_index::VariantIndex;
use ahash::RandomState;
use dashmap::DashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// What a closed writer put on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: u64,
    pub pairs: u64,
    pub variants: u64,
    pub file_len: u64,
}

impl fmt::Display for WriteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows, {} pairs, {} variants, {} bytes",
            self.rows, self.pairs, self.variants, self.file_len
        )
    }
}

pub struct LdMatrixWriter {
    variant_index: Arc<VariantIndex>,
    gz: ChunkedGzWriter,
    /// Variants A that already have a row.
    claimed: DashSet<u32, RandomState>,
    entries: Mutex<Vec<IndexEntry>>,
    pairs: AtomicU64,
    path: PathBuf,
}

impl LdMatrixWriter {
    /// Creates (or truncates) `path` and writes the header.
    pub fn open(
        variant_index: Arc<VariantIndex>,
        path: &Path,
        compression_level: u32,
    ) -> Result<Self> {
        let gz = ChunkedGzWriter::open(path, compression_level)?;
        log::info!(
            "Opened LD matrix '{}' for writing (compression level {compression_level})",
            path.display()
        );
        Ok(Self {
            variant_index,
            gz,
            claimed: DashSet::with_hasher(RandomState::new()),
            entries: Mutex::new(Vec::new()),
            pairs: AtomicU64::new(0),
            path: path.to_path_buf(),
        })
    }

    pub fn variant_index(&self) -> &Arc<VariantIndex> {
        &self.variant_index
    }

    /// Stores the row of `variant_a` as `(variant_b[i], r2[i])` pairs in list order.
    ///
    /// An empty row is skipped and leaves no index entry.
    ///
    /// # Errors
    /// * `InvalidArgument` if the lists differ in length, if any index has not been
    ///   assigned by the variant index, or if `variant_a` already has a row.
    /// * `Io` / `Compression` if the chunk cannot be written.
    pub fn add_variant(&self, variant_a: u32, variant_b: &[u32], r2: &[f32]) -> Result<()> {
        if variant_b.len() != r2.len() {
            return Err(LdError::InvalidArgument(format!(
                "Row for variant {variant_a} has {} partners but {} r2 values.",
                variant_b.len(),
                r2.len()
            )));
        }
        if variant_b.is_empty() {
            return Ok(());
        }

        let known = self.variant_index.len();
        if let Some(unknown) = std::iter::once(&variant_a)
            .chain(variant_b)
            .find(|index| **index as usize >= known)
        {
            return Err(LdError::InvalidArgument(format!(
                "Variant index {unknown} has not been assigned ({known} variants are known)."
            )));
        }
        let row_count = u32::try_from(variant_b.len()).map_err(|_| {
            LdError::InvalidArgument(format!(
                "Row for variant {variant_a} has too many partners ({}).",
                variant_b.len()
            ))
        })?;

        if !self.claimed.insert(variant_a) {
            return Err(LdError::InvalidArgument(format!(
                "Variant {variant_a} already has a stored row."
            )));
        }

        let payload = format::encode_row(variant_b, r2);
        let chunk = match self.gz.append_located(&payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.claimed.remove(&variant_a);
                return Err(e);
            }
        };

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(IndexEntry {
                variant_index: variant_a,
                file_offset: chunk.offset,
                compressed_length: chunk.coordinates.compressed_length,
                uncompressed_length: chunk.coordinates.uncompressed_length,
                row_count,
            });
        self.pairs.fetch_add(u64::from(row_count), Ordering::Relaxed);
        Ok(())
    }

    /// Registers `variant_a_id` and every partner id in the variant index, then stores
    /// the row.
    pub fn add_pairs<I, S>(&self, variant_a_id: &str, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, f32)>,
        S: AsRef<str>,
    {
        let variant_a = self.variant_index.add(variant_a_id);
        let (variant_b, r2): (Vec<u32>, Vec<f32>) = pairs
            .into_iter()
            .map(|(id, value)| (self.variant_index.add(id.as_ref()), value))
            .unzip();
        self.add_variant(variant_a, &variant_b, &r2)
    }

    /// Number of rows stored so far.
    pub fn row_count(&self) -> usize {
        self.claimed.len()
    }

    /// Appends the variant table, the index section and the footer, then writes the
    /// trailer and closes the file.
    pub fn close(self) -> Result<WriteSummary> {
        let mut entries = self
            .entries
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        entries.sort_unstable_by_key(|entry| entry.file_offset);

        let variant_table = self.variant_index.encode();
        let variant_count = u32::try_from(self.variant_index.len()).map_err(|_| {
            LdError::InvalidArgument("Too many variants for a single matrix.".to_string())
        })?;
        let table_chunk = self.gz.append_located(&variant_table)?;

        let mut index_bytes = Vec::with_capacity(entries.len() * INDEX_ENTRY_LEN);
        for entry in &entries {
            format::encode_entry(entry, &mut index_bytes);
        }
        let index_offset = self.gz.write_raw(&index_bytes)?;

        let footer = Footer {
            index_offset,
            entry_count: entries.len() as u64,
            variants_offset: table_chunk.offset,
            variants_compressed_length: table_chunk.coordinates.compressed_length,
            variants_uncompressed_length: table_chunk.coordinates.uncompressed_length,
            variant_count,
        };
        self.gz.write_raw(&footer.encode())?;
        let file_len = self.gz.close()?;

        let summary = WriteSummary {
            rows: entries.len() as u64,
            pairs: self.pairs.into_inner(),
            variants: u64::from(variant_count),
            file_len,
        };
        log::info!("Wrote LD matrix '{}': {summary}", self.path.display());
        Ok(summary)
    }

    /// Abandons the matrix and deletes the partial file.
    pub fn discard(self) -> Result<()> {
        log::warn!("Discarding incomplete LD matrix '{}'", self.path.display());
        self.gz.discard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gz::{GZIP_HEADER, GZIP_TRAILER_LEN};
    use crate::ld::format::FOOTER_LEN;
    use tempfile::tempdir;

    fn writer_with(ids: &[&str]) -> (tempfile::TempDir, PathBuf, LdMatrixWriter) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.tld");
        let index = Arc::new(VariantIndex::from_ids(ids).unwrap());
        let writer = LdMatrixWriter::open(index, &path, 6).unwrap();
        (dir, path, writer)
    }

    #[test]
    fn rejects_mismatched_and_unknown_rows() {
        let (_dir, _path, writer) = writer_with(&["a", "b", "c"]);
        assert!(matches!(
            writer.add_variant(0, &[1, 2], &[0.5]),
            Err(LdError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.add_variant(0, &[7], &[0.5]),
            Err(LdError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.add_variant(9, &[1], &[0.5]),
            Err(LdError::InvalidArgument(_))
        ));
        assert_eq!(writer.row_count(), 0);
    }

    #[test]
    fn empty_rows_leave_no_entry_and_duplicates_are_rejected() {
        let (_dir, _path, writer) = writer_with(&["a", "b", "c"]);
        writer.add_variant(0, &[], &[]).unwrap();
        assert_eq!(writer.row_count(), 0);

        writer.add_variant(0, &[1, 2], &[0.25, 0.75]).unwrap();
        assert!(matches!(
            writer.add_variant(0, &[2], &[0.1]),
            Err(LdError::InvalidArgument(_))
        ));
        let summary = writer.close().unwrap();
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.pairs, 2);
        assert_eq!(summary.variants, 3);
    }

    #[test]
    fn add_pairs_registers_new_ids() {
        let (_dir, _path, writer) = writer_with(&[]);
        writer
            .add_pairs("rs1", [("rs2", 0.5f32), ("rs3", 0.25)])
            .unwrap();
        let index = Arc::clone(writer.variant_index());
        assert_eq!(index.len(), 3);
        assert_eq!(index.get_index("rs3").unwrap(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn closed_file_has_header_footer_and_trailer() {
        let (_dir, path, writer) = writer_with(&["a", "b"]);
        writer.add_variant(1, &[0], &[0.9]).unwrap();
        let summary = writer.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, summary.file_len);
        assert_eq!(&bytes[..10], &GZIP_HEADER);

        let footer_at = bytes.len() - GZIP_TRAILER_LEN as usize - FOOTER_LEN;
        let raw: [u8; FOOTER_LEN] = bytes[footer_at..footer_at + FOOTER_LEN].try_into().unwrap();
        let footer = Footer::decode(&raw).unwrap();
        footer.validate(bytes.len() as u64).unwrap();
        assert_eq!(footer.entry_count, 1);
        assert_eq!(footer.variant_count, 2);
    }

    #[test]
    fn failed_append_releases_the_claim() {
        let (_dir, _path, writer) = writer_with(&["a", "b"]);
        writer.gz.release_for_test();
        assert!(matches!(
            writer.add_variant(0, &[1], &[0.5]),
            Err(LdError::InvalidArgument(_))
        ));
        assert!(!writer.claimed.contains(&0));
        assert_eq!(writer.row_count(), 0);
        assert_eq!(writer.pairs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn discarded_matrix_is_removed() {
        let (_dir, path, writer) = writer_with(&["a", "b"]);
        writer.add_variant(0, &[1], &[0.5]).unwrap();
        assert!(path.exists());
        writer.discard().unwrap();
        assert!(!path.exists());
    }
}
