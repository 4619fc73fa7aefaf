// ========================================================================================
//
//                         THE CHUNKED, INDEXED GZIP WRITER
//
// ========================================================================================
//
// ### Purpose ###
//
// Produces one continuous raw DEFLATE stream inside a minimal gzip envelope where
// every appended chunk ends with a full flush. A full flush byte-aligns the output
// and resets the compressor's history, so the compressed bytes of a single chunk can
// be sliced out of the file and inflated on their own. This is what makes random
// access into the LD matrix possible. The price is a lower compression ratio for
// small chunks.
//
// ### Concurrency ###
//
// The deflate state carries history between calls and cannot be shared by
// overlapping appends. A single mutex therefore serializes compression and the file
// write as one unit.

use crate::error::{LdError, Result};
use crate::types::{ChunkCoordinates, LocatedChunk};
use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Length of the gzip member header. Content starts at this offset.
pub const GZIP_HEADER_LEN: u64 = 10;
/// Length of the trailer holding the CRC-32 and the uncompressed length.
pub const GZIP_TRAILER_LEN: u64 = 8;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Compression method for the deflate algorithm, the only one gzip defines.
const DEFLATED: u8 = 8;
const MAX_COMPRESSION_LEVEL: u32 = 9;

/// The fixed gzip header: magic, method, no flags, zero mtime, no extra flags, OS 0.
pub const GZIP_HEADER: [u8; GZIP_HEADER_LEN as usize] =
    [GZIP_MAGIC[0], GZIP_MAGIC[1], DEFLATED, 0, 0, 0, 0, 0, 0, 0];

struct WriterState {
    file: BufWriter<File>,
    compressor: Compress,
    crc: Crc,
    /// Absolute offset of the next byte written to the file.
    position: u64,
    /// Reused output buffer for compressed bytes.
    scratch: Vec<u8>,
}

/// A gzip-compatible writer whose appended chunks are independently decodable.
///
/// Call [`ChunkedGzWriter::close`] to write the trailer. If the writer is dropped
/// without being closed, the trailer is written on a best-effort basis and any
/// failure is logged.
pub struct ChunkedGzWriter {
    state: Mutex<Option<WriterState>>,
    path: PathBuf,
}

impl ChunkedGzWriter {
    /// Creates (or truncates) `path`, writes the gzip header, and prepares a raw
    /// deflate compressor at `compression_level` (0 to 9).
    pub fn open(path: &Path, compression_level: u32) -> Result<Self> {
        if compression_level > MAX_COMPRESSION_LEVEL {
            return Err(LdError::InvalidArgument(format!(
                "Compression level {compression_level} is outside 0..={MAX_COMPRESSION_LEVEL}."
            )));
        }

        let file = File::create(path).map_err(|e| {
            LdError::Io(std::io::Error::new(
                e.kind(),
                format!("Creating {}: {e}", path.display()),
            ))
        })?;
        let mut file = BufWriter::new(file);
        file.write_all(&GZIP_HEADER)?;

        Ok(Self {
            state: Mutex::new(Some(WriterState {
                file,
                compressor: Compress::new(Compression::new(compression_level), false),
                crc: Crc::new(),
                position: GZIP_HEADER_LEN,
                scratch: Vec::new(),
            })),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compresses `bytes` with a full flush and writes the result at the current
    /// file position.
    pub fn append(&self, bytes: &[u8]) -> Result<ChunkCoordinates> {
        self.append_located(bytes).map(|chunk| chunk.coordinates)
    }

    /// Like [`ChunkedGzWriter::append`], also reporting the absolute offset at which
    /// the compressed bytes were written.
    pub fn append_located(&self, bytes: &[u8]) -> Result<LocatedChunk> {
        let uncompressed_length = u32::try_from(bytes.len()).map_err(|_| {
            LdError::InvalidArgument(format!(
                "Chunk of {} bytes exceeds the 4 GiB chunk limit.",
                bytes.len()
            ))
        })?;

        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = guard.as_mut().ok_or_else(closed_error)?;

        deflate_full_flush(&mut state.compressor, bytes, &mut state.scratch)?;
        if !bytes.is_empty() && state.scratch.is_empty() {
            return Err(LdError::Compression(format!(
                "Deflate produced no output for a {}-byte chunk.",
                bytes.len()
            )));
        }
        let compressed_length = u32::try_from(state.scratch.len()).map_err(|_| {
            LdError::Compression("Compressed chunk exceeds 4 GiB.".to_string())
        })?;

        let offset = state.position;
        state.file.write_all(&state.scratch)?;
        state.crc.update(bytes);
        state.position += u64::from(compressed_length);

        Ok(LocatedChunk {
            offset,
            coordinates: ChunkCoordinates {
                compressed_length,
                uncompressed_length,
            },
        })
    }

    /// Writes `bytes` verbatim, outside the deflate stream and the CRC, and returns
    /// the offset at which they start. Used for sections that must be readable
    /// without decompression.
    pub fn write_raw(&self, bytes: &[u8]) -> Result<u64> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = guard.as_mut().ok_or_else(closed_error)?;
        let offset = state.position;
        state.file.write_all(bytes)?;
        state.position += bytes.len() as u64;
        Ok(offset)
    }

    /// The absolute offset of the next byte to be written.
    pub fn position(&self) -> Result<u64> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|state| state.position).ok_or_else(closed_error)
    }

    /// Writes the trailer (CRC-32 of every appended byte, then the total uncompressed
    /// length modulo 2^32), flushes, and closes the file. Returns the final file length.
    pub fn close(self) -> Result<u64> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(closed_error)?;
        finish(state)
    }

    /// Closes the file without a trailer and deletes it.
    pub fn discard(self) -> Result<()> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(state);
        std::fs::remove_file(&self.path).map_err(|e| {
            LdError::Io(std::io::Error::new(
                e.kind(),
                format!("Removing {}: {e}", self.path.display()),
            ))
        })
    }

    /// Releases the file so that every later write fails as closed.
    #[cfg(test)]
    pub(crate) fn release_for_test(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for ChunkedGzWriter {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(state) = state {
            if let Err(e) = finish(state) {
                log::warn!(
                    "Failed to finalize {} while dropping the writer: {e}",
                    self.path.display()
                );
            }
        }
    }
}

fn closed_error() -> LdError {
    LdError::InvalidArgument("The chunked gzip writer is already closed.".to_string())
}

fn finish(mut state: WriterState) -> Result<u64> {
    let mut trailer = [0u8; GZIP_TRAILER_LEN as usize];
    trailer[..4].copy_from_slice(&state.crc.sum().to_le_bytes());
    trailer[4..].copy_from_slice(&state.crc.amount().to_le_bytes());
    state.file.write_all(&trailer)?;
    state.file.flush()?;
    state.file.get_ref().sync_all()?;
    Ok(state.position + GZIP_TRAILER_LEN)
}

/// Runs `input` through the compressor with a full flush, leaving exactly the bytes
/// produced by this call in `output`.
fn deflate_full_flush(compressor: &mut Compress, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
    output.clear();
    output.reserve(input.len() + input.len() / 8 + 64);
    let start = compressor.total_in();

    loop {
        let consumed = (compressor.total_in() - start) as usize;
        compressor
            .compress_vec(&input[consumed..], output, FlushCompress::Full)
            .map_err(|e| LdError::Compression(e.to_string()))?;

        let consumed = (compressor.total_in() - start) as usize;
        // The flush is complete once all input is in and the compressor stopped
        // short of filling the buffer.
        if consumed == input.len() && output.len() < output.capacity() {
            return Ok(());
        }
        output.reserve(output.capacity().max(64));
    }
}

/// Inflates one independently-flushed chunk. `compressed` must be exactly the bytes
/// reported for the chunk and must inflate to exactly `uncompressed_length` bytes.
pub fn inflate_chunk(compressed: &[u8], uncompressed_length: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(uncompressed_length);
    if uncompressed_length == 0 {
        return Ok(output);
    }

    let mut decompressor = Decompress::new(false);
    loop {
        let before_in = decompressor.total_in();
        let before_out = decompressor.total_out();
        let consumed = before_in as usize;
        decompressor
            .decompress_vec(&compressed[consumed..], &mut output, FlushDecompress::Sync)
            .map_err(|e| LdError::Compression(format!("Inflating chunk failed: {e}")))?;

        if output.len() == uncompressed_length {
            return Ok(output);
        }
        if decompressor.total_in() == before_in && decompressor.total_out() == before_out {
            break;
        }
    }

    if output.is_empty() {
        return Err(LdError::Compression(
            "Chunk inflated to zero bytes; input is missing or needs a dictionary.".to_string(),
        ));
    }
    Err(LdError::Compression(format!(
        "Unexpected number of bytes inflated {} (expected: {uncompressed_length}).",
        output.len()
    )))
}
