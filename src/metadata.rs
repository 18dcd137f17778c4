//! Metadata block streams.
//!
//! Inodes, directory listings and the auxiliary tables are all serialized
//! into streams of metadata blocks: chunks of at most 8 KiB, individually
//! compressed (or stored raw under the anti-expansion rule) and prefixed
//! with a 2-byte header encoding the stored size and a "stored raw" flag.
//! Blocks are addressable only by their absolute file offset.
//!
//! [`MetadataWriter`] accumulates primitive writes and flushes full blocks;
//! [`MetadataWriter::current_reference`] hands out a stable (block location,
//! byte offset) pair *before* the block is flushed, which is what lets the
//! tree builder and table generators reference records that are still
//! sitting in the write buffer.  [`MetadataReader`] is the inverse cursor,
//! advancing transparently across block boundaries.

use std::{cell::RefCell, collections::HashMap, io::Write, rc::Rc};

use log::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
    compression::Compressor,
    format::{InodeRef, METADATA_BLOCK_SIZE, METADATA_UNCOMPRESSED_FLAG},
    io::ReadAt,
    Result, SquashError,
};

/// One decoded metadata block.
#[derive(Debug)]
pub struct MetadataBlock {
    /// Decompressed payload, at most 8 KiB.
    pub data: Vec<u8>,
    /// Bytes the block occupies on disk, header included.
    pub disk_len: u64,
}

impl MetadataBlock {
    /// Reads and decodes the block starting at absolute `offset`.
    pub fn read<R: ReadAt + ?Sized>(
        storage: &R,
        offset: u64,
        compressor: &Compressor,
    ) -> Result<Self> {
        let mut header = [0u8; 2];
        storage.read_exact_at(offset, &mut header)?;
        let header = u16::from_le_bytes(header);
        let stored = (header & !METADATA_UNCOMPRESSED_FLAG) as usize;
        if stored == 0 || stored > METADATA_BLOCK_SIZE {
            return Err(SquashError::CorruptMetadataBlock(offset));
        }

        let mut payload = vec![0u8; stored];
        storage.read_exact_at(offset + 2, &mut payload)?;

        let data = if header & METADATA_UNCOMPRESSED_FLAG != 0 {
            payload
        } else {
            compressor.decompress(&payload, METADATA_BLOCK_SIZE)?
        };

        Ok(Self {
            data,
            disk_len: 2 + stored as u64,
        })
    }
}

/// Cache behavior for decoded blocks within one reader instance.
///
/// `None` (always re-decode) is the baseline and always correct; `Unbounded`
/// trades memory for skipping repeated decompression of hot blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    None,
    #[default]
    Unbounded,
}

/// Plain key→value block cache, private to one reader.
pub(crate) struct BlockCache<V> {
    map: Option<RefCell<HashMap<u64, Rc<V>>>>,
}

impl<V> BlockCache<V> {
    pub(crate) fn new(policy: CachePolicy) -> Self {
        Self {
            map: match policy {
                CachePolicy::None => None,
                CachePolicy::Unbounded => Some(RefCell::new(HashMap::new())),
            },
        }
    }

    pub(crate) fn get_or_try_insert_with(
        &self,
        key: u64,
        read: impl FnOnce() -> Result<V>,
    ) -> Result<Rc<V>> {
        let Some(map) = &self.map else {
            return Ok(Rc::new(read()?));
        };
        if let Some(hit) = map.borrow().get(&key) {
            return Ok(Rc::clone(hit));
        }
        let value = Rc::new(read()?);
        map.borrow_mut().insert(key, Rc::clone(&value));
        Ok(value)
    }
}

/// Reference into a metadata stream: byte offset of the containing block
/// relative to the stream start, plus the offset within the decoded block.
///
/// References taken via [`MetadataWriter::current_reference`] are final as
/// soon as they are taken: the location counts only already-encoded blocks,
/// and the in-progress buffer always flushes as the next block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataRef {
    pub location: u32,
    pub offset: u16,
}

impl MetadataRef {
    pub fn inode_ref(self) -> InodeRef {
        InodeRef::new(self.location, self.offset)
    }
}

/// Accumulates primitive writes into 8 KiB blocks, keeping the encoded
/// stream in memory until [`MetadataWriter::save`].
pub struct MetadataWriter {
    compressor: Compressor,
    encoded: Vec<u8>,
    buffer: Vec<u8>,
}

impl MetadataWriter {
    pub fn new(compressor: Compressor) -> Self {
        Self {
            compressor,
            encoded: Vec::new(),
            buffer: Vec::with_capacity(METADATA_BLOCK_SIZE),
        }
    }

    /// A reference to the next byte that will be written.
    pub fn current_reference(&self) -> MetadataRef {
        MetadataRef {
            location: self.encoded.len() as u32,
            offset: self.buffer.len() as u16,
        }
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = METADATA_BLOCK_SIZE - self.buffer.len();
            let n = room.min(data.len());
            self.buffer.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buffer.len() == METADATA_BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    pub fn write_struct(&mut self, st: impl IntoBytes + Immutable) -> Result<()> {
        self.write(st.as_bytes())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let (header, payload) = match self.compressor.compress(&self.buffer)? {
            Some(compressed) => (compressed.len() as u16, compressed),
            None => (
                self.buffer.len() as u16 | METADATA_UNCOMPRESSED_FLAG,
                std::mem::take(&mut self.buffer),
            ),
        };
        trace!(
            "metadata block flush: {} bytes stored at stream offset {}",
            payload.len(),
            self.encoded.len()
        );
        self.encoded.extend_from_slice(&header.to_le_bytes());
        self.encoded.extend_from_slice(&payload);
        self.buffer.clear();
        Ok(())
    }

    /// Flushes the trailing partial block and writes the whole encoded
    /// stream to `out`, returning its total length in bytes.
    pub fn save(&mut self, out: &mut impl Write) -> Result<u64> {
        self.flush_block()?;
        out.write_all(&self.encoded)?;
        Ok(self.encoded.len() as u64)
    }
}

/// Cursor over a metadata stream, decompressing blocks on demand.
pub struct MetadataReader<'r, R: ReadAt + ?Sized> {
    storage: &'r R,
    compressor: &'r Compressor,
    cache: &'r BlockCache<MetadataBlock>,
    block: Rc<MetadataBlock>,
    /// Absolute file offset of the block after the current one.
    next_block: u64,
    pos_in_block: usize,
    position: usize,
}

impl<'r, R: ReadAt + ?Sized> MetadataReader<'r, R> {
    pub(crate) fn new(
        storage: &'r R,
        compressor: &'r Compressor,
        cache: &'r BlockCache<MetadataBlock>,
        block_start: u64,
        offset: u16,
    ) -> Result<Self> {
        let block = cache.get_or_try_insert_with(block_start, || {
            MetadataBlock::read(storage, block_start, compressor)
        })?;
        if offset as usize > block.data.len() {
            return Err(SquashError::CorruptMetadataBlock(block_start));
        }
        Ok(Self {
            storage,
            compressor,
            cache,
            next_block: block_start + block.disk_len,
            block,
            pos_in_block: offset as usize,
            position: 0,
        })
    }

    /// Logical bytes consumed since the cursor was created.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes still available without decoding another block.
    pub fn available(&self) -> usize {
        self.block.data.len() - self.pos_in_block
    }

    fn advance(&mut self) -> Result<()> {
        let offset = self.next_block;
        self.block = self.cache.get_or_try_insert_with(offset, || {
            MetadataBlock::read(self.storage, offset, self.compressor)
        })?;
        self.next_block = offset + self.block.disk_len;
        self.pos_in_block = 0;
        Ok(())
    }

    /// True once the underlying storage ends at the next block boundary.
    ///
    /// Only meaningful when the stream runs to the end of the storage; in
    /// the middle of an image the "next block" would read into whatever
    /// table follows.
    pub fn is_eof(&mut self) -> Result<bool> {
        if self.available() > 0 {
            return Ok(false);
        }
        match self.advance() {
            Ok(()) => Ok(false),
            Err(SquashError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            if self.available() == 0 {
                self.advance()?;
            }
            let n = self.available().min(buf.len());
            let start = self.pos_in_block;
            buf[..n].copy_from_slice(&self.block.data[start..start + n]);
            buf = &mut buf[n..];
            self.pos_in_block += n;
            self.position += n;
        }
        Ok(())
    }

    /// Reads a fixed-size on-disk record.
    pub fn read_struct<T: FromBytes + IntoBytes + Default>(&mut self) -> Result<T> {
        let mut value = T::default();
        self.read_exact(value.as_mut_bytes())?;
        Ok(value)
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn skip(&mut self, mut len: usize) -> Result<()> {
        let mut scratch = [0u8; 512];
        while len > 0 {
            let n = len.min(scratch.len());
            self.read_exact(&mut scratch[..n])?;
            len -= n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reader_over<'r>(
        data: &'r [u8],
        compressor: &'r Compressor,
        cache: &'r BlockCache<MetadataBlock>,
        offset: u16,
    ) -> MetadataReader<'r, [u8]> {
        MetadataReader::new(data, compressor, cache, 0, offset).unwrap()
    }

    #[test]
    fn test_roundtrip_across_blocks() {
        for compressor in [Compressor::None, Compressor::Zlib, Compressor::zstd()] {
            let payload = pattern(20000); // spans three blocks
            let mut writer = MetadataWriter::new(compressor.clone());
            writer.write(&payload).unwrap();
            let mut encoded = Vec::new();
            writer.save(&mut encoded).unwrap();

            let cache = BlockCache::new(CachePolicy::None);
            let mut reader = reader_over(&encoded, &compressor, &cache, 0);
            let restored = reader.read_vec(payload.len()).unwrap();
            assert_eq!(restored, payload);
            assert_eq!(reader.position(), payload.len());
            assert!(reader.is_eof().unwrap());
        }
    }

    #[test]
    fn test_current_reference_tracks_flushes() {
        let mut writer = MetadataWriter::new(Compressor::None);
        assert_eq!(
            writer.current_reference(),
            MetadataRef {
                location: 0,
                offset: 0
            }
        );

        writer.write(&pattern(100)).unwrap();
        assert_eq!(writer.current_reference().offset, 100);

        // filling the first block flushes it eagerly, so the reference
        // points at the start of the next block
        writer.write(&pattern(METADATA_BLOCK_SIZE - 100)).unwrap();
        let reference = writer.current_reference();
        assert_eq!(reference.offset, 0);
        // raw storage: 2-byte header plus the full payload
        assert_eq!(reference.location, 2 + METADATA_BLOCK_SIZE as u32);
    }

    #[test]
    fn test_incompressible_block_stored_raw() {
        // one byte compresses to more than one byte under zlib
        let mut writer = MetadataWriter::new(Compressor::Zlib);
        writer.write(&[42]).unwrap();
        let mut encoded = Vec::new();
        writer.save(&mut encoded).unwrap();
        let header = u16::from_le_bytes([encoded[0], encoded[1]]);
        assert_eq!(header, 1 | METADATA_UNCOMPRESSED_FLAG);
        assert_eq!(&encoded[2..], &[42]);
    }

    #[test]
    fn test_compressed_block_shrinks() {
        let mut writer = MetadataWriter::new(Compressor::Zlib);
        writer.write(&[0u8; METADATA_BLOCK_SIZE]).unwrap();
        let mut encoded = Vec::new();
        let len = writer.save(&mut encoded).unwrap();
        assert!(len < METADATA_BLOCK_SIZE as u64);
        let header = u16::from_le_bytes([encoded[0], encoded[1]]);
        assert_eq!(header & METADATA_UNCOMPRESSED_FLAG, 0);
    }

    #[test]
    fn test_reader_honors_start_offset() {
        let mut writer = MetadataWriter::new(Compressor::None);
        writer.write(&pattern(1000)).unwrap();
        let mut encoded = Vec::new();
        writer.save(&mut encoded).unwrap();

        let compressor = Compressor::None;
        let cache = BlockCache::new(CachePolicy::Unbounded);
        let mut reader = reader_over(&encoded, &compressor, &cache, 700);
        assert_eq!(reader.read_vec(300).unwrap(), pattern(1000)[700..]);
    }

    #[test]
    fn test_truncated_block_is_an_error() {
        let mut writer = MetadataWriter::new(Compressor::None);
        writer.write(&pattern(100)).unwrap();
        let mut encoded = Vec::new();
        writer.save(&mut encoded).unwrap();
        encoded.truncate(50);

        let compressor = Compressor::None;
        let cache = BlockCache::new(CachePolicy::None);
        let err = MetadataReader::new(encoded.as_slice(), &compressor, &cache, 0, 0)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, SquashError::Io(_)));
    }
}
