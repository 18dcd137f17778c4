//! Data blocks and tail-end fragments.
//!
//! File content is cut into block-size chunks.  Full chunks become data
//! blocks, written at the current end of the image; all-zero chunks are
//! elided entirely and recorded as sparse.  A short tail is handed to the
//! [`FragmentWriter`], which packs tails from many files into shared
//! fragment blocks.  A tail's fragment index is unknown until its block
//! fills (or the final flush), so the writer hands back a [`FragmentRef`]
//! that resolves once the block is committed.

use std::{cell::Cell, io::Write, rc::Rc};

use log::trace;

use crate::{
    compression::Compressor,
    format::{BlockSize, FragmentEntry},
    io::ReadAt,
    Result, SquashError,
};

/// Writes one chunk of file content as a data block.  Returns the block's
/// size entry and the number of bytes emitted (zero for a sparse block).
pub fn write_data_block(
    out: &mut impl Write,
    compressor: &Compressor,
    block_size: u32,
    data: &[u8],
) -> Result<(BlockSize, u64)> {
    if data.is_empty() || data.len() > block_size as usize {
        return Err(SquashError::InvalidBlockLength(
            data.len(),
            block_size as usize,
        ));
    }
    if data.iter().all(|&b| b == 0) {
        return Ok((BlockSize::sparse(), 0));
    }
    match compressor.compress(data)? {
        Some(compressed) => {
            out.write_all(&compressed)?;
            Ok((BlockSize::new(compressed.len() as u32, true), compressed.len() as u64))
        }
        None => {
            out.write_all(data)?;
            Ok((BlockSize::new(data.len() as u32, false), data.len() as u64))
        }
    }
}

/// Reads one data block back.  The caller resolves sparse entries itself;
/// this is only for blocks that occupy bytes on disk.
pub fn read_data_block<R: ReadAt + ?Sized>(
    storage: &R,
    offset: u64,
    size: BlockSize,
    compressor: &Compressor,
    block_size: u32,
) -> Result<Vec<u8>> {
    let mut stored = vec![0u8; size.stored_size() as usize];
    storage.read_exact_at(offset, &mut stored)?;
    if size.is_compressed() {
        compressor.decompress(&stored, block_size as usize)
    } else {
        Ok(stored)
    }
}

/// Reads and decodes one whole fragment block.
pub fn read_fragment_block<R: ReadAt + ?Sized>(
    storage: &R,
    base: u64,
    entry: &FragmentEntry,
    compressor: &Compressor,
    block_size: u32,
) -> Result<Vec<u8>> {
    let mut stored = vec![0u8; entry.stored_size() as usize];
    storage.read_exact_at(base + entry.start.get(), &mut stored)?;
    if entry.is_compressed() {
        compressor.decompress(&stored, block_size as usize)
    } else {
        Ok(stored)
    }
}

struct FragmentSlot {
    /// Byte offset of the tail within its fragment block.
    offset: u32,
    /// Fragment table index, set when the block commits.
    index: Cell<Option<u32>>,
}

/// Handle to a tail placed in a not-yet-committed fragment block.
#[derive(Clone)]
pub struct FragmentRef(Rc<FragmentSlot>);

impl FragmentRef {
    /// The (fragment index, byte offset) pair once the block is committed.
    pub fn committed(&self) -> Option<(u32, u32)> {
        self.0.index.get().map(|index| (index, self.0.offset))
    }
}

/// Packs file tails into shared fragment blocks.
pub struct FragmentWriter {
    block_size: u32,
    compressor: Compressor,
    buffer: Vec<u8>,
    pending: Vec<FragmentRef>,
    entries: Vec<FragmentEntry>,
}

impl FragmentWriter {
    pub fn new(block_size: u32, compressor: Compressor) -> Self {
        Self {
            block_size,
            compressor,
            buffer: Vec::with_capacity(block_size as usize),
            pending: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Buffers one tail, flushing the current block first if the tail would
    /// not fit.  `position` is the image-relative offset at which a flushed
    /// block would land; the second return value is the bytes emitted by
    /// that flush, if any.
    pub fn write(
        &mut self,
        out: &mut impl Write,
        position: u64,
        data: &[u8],
    ) -> Result<(FragmentRef, u64)> {
        if data.is_empty() || data.len() >= self.block_size as usize {
            return Err(SquashError::InvalidFragmentLength(
                data.len(),
                self.block_size as usize - 1,
            ));
        }
        let emitted = if self.buffer.len() + data.len() > self.block_size as usize {
            self.flush(out, position)?
        } else {
            0
        };
        let fragment = FragmentRef(Rc::new(FragmentSlot {
            offset: self.buffer.len() as u32,
            index: Cell::new(None),
        }));
        self.buffer.extend_from_slice(data);
        self.pending.push(fragment.clone());
        Ok((fragment, emitted))
    }

    /// Commits the buffered block, resolving all pending refs to the new
    /// fragment table index.  Returns the bytes emitted.
    pub fn flush(&mut self, out: &mut impl Write, position: u64) -> Result<u64> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let (entry, emitted) = match self.compressor.compress(&self.buffer)? {
            Some(compressed) => {
                out.write_all(&compressed)?;
                (
                    FragmentEntry::new(position, compressed.len() as u32, true),
                    compressed.len() as u64,
                )
            }
            None => {
                out.write_all(&self.buffer)?;
                (
                    FragmentEntry::new(position, self.buffer.len() as u32, false),
                    self.buffer.len() as u64,
                )
            }
        };
        let index = self.entries.len() as u32;
        trace!(
            "fragment block {index}: {} tails, {} bytes stored at {position}",
            self.pending.len(),
            emitted
        );
        self.entries.push(entry);
        for fragment in self.pending.drain(..) {
            fragment.0.index.set(Some(index));
        }
        self.buffer.clear();
        Ok(emitted)
    }

    pub fn entries(&self) -> &[FragmentEntry] {
        &self.entries
    }
}
