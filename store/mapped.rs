// ========================================================================================
//
//                      THE BLOCK-PARTITIONED MEMORY-MAPPED READER
//
// ========================================================================================
//
// ### Purpose ###
//
// Exposes random, byte-addressed reads over a finalized, read-only section of a file.
// The section is mapped as a sequence of fixed-size blocks, each behind its own
// mutex, so many threads can read different regions at once while access to any
// single block is serialized.
//
// ### Lock Ordering ###
//
// A cursor holds at most one block at a time, and only ever moves to the next block
// by releasing the current one first. Blocks are therefore acquired in strictly
// increasing index order and no cursor waits on a block while holding another, which
// rules out deadlock between concurrent cursors.
//
// ### Lifetime ###
//
// Mappings are released deterministically when the `BlockMappedFile` is dropped or
// explicitly closed. Cursors borrow the file, so the borrow checker guarantees no
// cursor outlives the mappings it reads from.

use crate::error::{LdError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One mapped block and the read position of whichever cursor currently holds it.
struct MappedBlock {
    map: Mmap,
    position: usize,
}

impl MappedBlock {
    #[inline]
    fn remaining(&self) -> usize {
        self.map.len() - self.position
    }
}

pub struct BlockMappedFile {
    blocks: Box<[Mutex<MappedBlock>]>,
    block_size: u64,
    section_len: u64,
}

impl std::fmt::Debug for BlockMappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMappedFile")
            .field("blocks", &self.blocks.len())
            .field("block_size", &self.block_size)
            .field("section_len", &self.section_len)
            .finish()
    }
}

impl BlockMappedFile {
    /// Maps `[section_offset, section_offset + section_len)` of `file` as
    /// `ceil(section_len / block_size)` read-only blocks. The last block may be short.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a zero block size or a section that extends past
    /// the end of the file, and `Io` if a mapping cannot be created.
    pub fn open(file: &File, section_offset: u64, section_len: u64, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(LdError::InvalidArgument(
                "Block size must be strictly positive.".to_string(),
            ));
        }
        let file_len = file.metadata()?.len();
        let section_end = section_offset.checked_add(section_len).filter(|end| *end <= file_len);
        if section_end.is_none() {
            return Err(LdError::InvalidArgument(format!(
                "Section [{section_offset}, +{section_len}) extends past the end of a {file_len}-byte file."
            )));
        }

        let n_blocks = section_len.div_ceil(block_size);
        let mut blocks = Vec::with_capacity(n_blocks as usize);
        for block_index in 0..n_blocks {
            let begin = block_index * block_size;
            let len = block_size.min(section_len - begin);
            // SAFETY: the file is opened read-only and the format is never modified
            // after the writer has closed it.
            let map = unsafe {
                MmapOptions::new()
                    .offset(section_offset + begin)
                    .len(len as usize)
                    .map(file)?
            };
            blocks.push(Mutex::new(MappedBlock { map, position: 0 }));
        }

        log::debug!(
            "Mapped {section_len} bytes at offset {section_offset} as {n_blocks} blocks of {block_size} bytes"
        );

        Ok(Self {
            blocks: blocks.into_boxed_slice(),
            block_size,
            section_len,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn section_len(&self) -> u64 {
        self.section_len
    }

    /// Opens a cursor at `byte_index` within the mapped section, waiting for the
    /// containing block if another cursor holds it.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `byte_index` is not inside the section.
    pub fn open_cursor(&self, byte_index: u64) -> Result<Cursor<'_>> {
        if byte_index >= self.section_len {
            return Err(LdError::InvalidArgument(format!(
                "Byte index {byte_index} is outside the mapped section of {} bytes.",
                self.section_len
            )));
        }

        let block_index = (byte_index / self.block_size) as usize;
        let mut guard = self.lock_block(block_index);
        guard.position = (byte_index % self.block_size) as usize;

        Ok(Cursor {
            file: self,
            block_index,
            guard: Some(guard),
        })
    }

    /// Unmaps every block. Equivalent to dropping the value; provided so callers can
    /// make the release point explicit.
    pub fn close(self) {
        log::debug!("Unmapping {} blocks", self.blocks.len());
    }

    fn lock_block(&self, block_index: usize) -> MutexGuard<'_, MappedBlock> {
        // A panic while holding a block cannot corrupt the read-only mapping; only the
        // position is reset by the next cursor.
        self.blocks[block_index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A read position inside a [`BlockMappedFile`] that holds exactly one block lock.
///
/// Values are decoded little-endian. Reads that straddle a block boundary are
/// stitched together: the tail of the current block is copied, its lock released,
/// and the next block locked to copy the rest. Dropping the cursor releases the
/// block it holds.
pub struct Cursor<'a> {
    file: &'a BlockMappedFile,
    block_index: usize,
    guard: Option<MutexGuard<'a, MappedBlock>>,
}

impl<'a> Cursor<'a> {
    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Reads `n` bytes, crossing as many block boundaries as needed.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; n];
        self.read_into(&mut bytes)?;
        Ok(bytes)
    }

    /// Fills `dst` from the current position.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the read would run past the end of the section.
    /// The bytes copied before the failure are left in `dst`.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let block = self.current_block()?;
            let remaining = block.remaining();
            if remaining == 0 {
                self.next_block()?;
                continue;
            }
            let n = remaining.min(dst.len() - filled);
            let start = block.position;
            dst[filled..filled + n].copy_from_slice(&block.map[start..start + n]);
            block.position += n;
            filled += n;
        }
        Ok(())
    }

    /// The position of the cursor relative to the start of the mapped section.
    pub fn position(&self) -> u64 {
        let in_block = self.guard.as_ref().map_or(0, |block| block.position);
        self.block_index as u64 * self.file.block_size + in_block as u64
    }

    /// Releases the block currently held. Dropping the cursor has the same effect.
    pub fn close(self) {}

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buffer = [0u8; N];
        let block = self.current_block()?;
        if block.remaining() >= N {
            let start = block.position;
            buffer.copy_from_slice(&block.map[start..start + N]);
            block.position += N;
        } else {
            self.read_into(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn current_block(&mut self) -> Result<&mut MutexGuard<'a, MappedBlock>> {
        self.guard.as_mut().ok_or_else(|| {
            LdError::InvalidArgument("Read past the end of the mapped section.".to_string())
        })
    }

    /// Releases the current block, then acquires the next one.
    fn next_block(&mut self) -> Result<()> {
        self.guard = None;
        let next = self.block_index + 1;
        if next >= self.file.blocks.len() {
            return Err(LdError::InvalidArgument(
                "Read past the end of the mapped section.".to_string(),
            ));
        }
        let mut guard = self.file.lock_block(next);
        guard.position = 0;
        self.block_index = next;
        self.guard = Some(guard);
        Ok(())
    }
}
