//! Lookup tables: ids, fragments, exports.
//!
//! All three share one layout: the fixed-size entries are packed into
//! metadata blocks, each holding a whole number of entries, and the
//! superblock's table-start offset points at a flat array of u64 absolute
//! offsets, one per metadata block.  Entry counts live in the superblock, so
//! the tables themselves carry no framing beyond the block headers.

use std::{
    collections::HashMap,
    io::Write,
    mem::size_of,
};

use log::debug;
use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes,
};

use crate::{
    compression::Compressor,
    format::{FragmentEntry, InodeRef, METADATA_BLOCK_SIZE},
    io::ReadAt,
    metadata::{MetadataBlock, MetadataWriter},
    Result, SquashError,
};

pub const ID_ENTRIES_PER_BLOCK: usize = METADATA_BLOCK_SIZE / size_of::<U32>();
pub const FRAGMENT_ENTRIES_PER_BLOCK: usize = METADATA_BLOCK_SIZE / size_of::<FragmentEntry>();
pub const EXPORT_ENTRIES_PER_BLOCK: usize = METADATA_BLOCK_SIZE / size_of::<U64>();

/// Encodes table entries into a metadata stream, returning the stream and
/// the stream-relative location of each block.
///
/// Entry sizes divide the block size evenly, so groups of `per_block`
/// entries land exactly on block boundaries and every location has offset 0.
pub fn encode_table<T: IntoBytes + Immutable>(
    entries: &[T],
    per_block: usize,
    compressor: &Compressor,
) -> Result<(Vec<u8>, Vec<u32>)> {
    let mut writer = MetadataWriter::new(compressor.clone());
    let mut locations = Vec::with_capacity(entries.len().div_ceil(per_block));
    for (i, entry) in entries.iter().enumerate() {
        if i % per_block == 0 {
            locations.push(writer.current_reference().location);
        }
        writer.write(entry.as_bytes())?;
    }
    let mut encoded = Vec::new();
    writer.save(&mut encoded)?;
    Ok((encoded, locations))
}

/// Reads `count` entries back out of a table.  `table_start` is the
/// image-relative offset of the block pointer array.
pub fn read_table<R, T>(
    storage: &R,
    base: u64,
    table_start: u64,
    count: usize,
    per_block: usize,
    compressor: &Compressor,
) -> Result<Vec<T>>
where
    R: ReadAt + ?Sized,
    T: FromBytes + IntoBytes,
{
    let block_count = count.div_ceil(per_block);
    let mut pointers = vec![0u8; block_count * size_of::<U64>()];
    storage.read_exact_at(base + table_start, &mut pointers)?;

    let mut entries = Vec::with_capacity(count);
    for pointer in pointers.chunks_exact(size_of::<U64>()) {
        let offset = u64::from_le_bytes(pointer.try_into().unwrap());
        let block = MetadataBlock::read(storage, base + offset, compressor)?;
        let want = per_block.min(count - entries.len());
        let need = want * size_of::<T>();
        if block.data.len() < need {
            return Err(SquashError::Corrupt("table metadata block too short"));
        }
        for chunk in block.data[..need].chunks_exact(size_of::<T>()) {
            // the chunk length matches by construction
            entries.push(T::read_from_bytes(chunk).unwrap());
        }
    }
    Ok(entries)
}

/// Collects distinct uids/gids in first-use order and hands out the 16-bit
/// indices inodes store.  Id 0 (root) is always present at index 0.
pub struct IdTableBuilder {
    ids: Vec<u32>,
    lookup: HashMap<u32, u16>,
}

impl Default for IdTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IdTableBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            ids: Vec::new(),
            lookup: HashMap::new(),
        };
        builder.intern(0).unwrap();
        builder
    }

    pub fn intern(&mut self, id: u32) -> Result<u16> {
        if let Some(&idx) = self.lookup.get(&id) {
            return Ok(idx);
        }
        // id_count in the superblock is 16-bit
        if self.ids.len() >= u16::MAX as usize {
            return Err(SquashError::IdTableFull);
        }
        let idx = self.ids.len() as u16;
        self.ids.push(id);
        self.lookup.insert(id, idx);
        Ok(idx)
    }

    pub fn count(&self) -> u16 {
        self.ids.len() as u16
    }

    pub fn encode(&self, compressor: &Compressor) -> Result<(Vec<u8>, Vec<u32>)> {
        debug!("id table: {} distinct ids", self.ids.len());
        let entries: Vec<U32> = self.ids.iter().map(|&id| U32::from(id)).collect();
        encode_table(&entries, ID_ENTRIES_PER_BLOCK, compressor)
    }
}

/// Decoded id table: index to uid/gid.
#[derive(Debug)]
pub struct IdTable {
    ids: Vec<u32>,
}

impl IdTable {
    pub fn read<R: ReadAt + ?Sized>(
        storage: &R,
        base: u64,
        table_start: u64,
        count: u16,
        compressor: &Compressor,
    ) -> Result<Self> {
        let entries: Vec<U32> = read_table(
            storage,
            base,
            table_start,
            count as usize,
            ID_ENTRIES_PER_BLOCK,
            compressor,
        )?;
        Ok(Self {
            ids: entries.iter().map(|e| e.get()).collect(),
        })
    }

    pub fn id(&self, idx: u16) -> Result<u32> {
        self.ids
            .get(idx as usize)
            .copied()
            .ok_or(SquashError::Corrupt("id index out of range"))
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}

/// Decoded fragment table: fragment index to block location.
#[derive(Debug)]
pub struct FragmentTable {
    entries: Vec<FragmentEntry>,
}

impl FragmentTable {
    pub fn read<R: ReadAt + ?Sized>(
        storage: &R,
        base: u64,
        table_start: u64,
        count: u32,
        compressor: &Compressor,
    ) -> Result<Self> {
        let entries = read_table(
            storage,
            base,
            table_start,
            count as usize,
            FRAGMENT_ENTRIES_PER_BLOCK,
            compressor,
        )?;
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, index: u32) -> Result<&FragmentEntry> {
        self.entries
            .get(index as usize)
            .ok_or(SquashError::Corrupt("fragment index out of range"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decoded export table: inode number to inode reference.
#[derive(Debug)]
pub struct ExportTable {
    refs: Vec<InodeRef>,
}

impl ExportTable {
    pub fn read<R: ReadAt + ?Sized>(
        storage: &R,
        base: u64,
        table_start: u64,
        inode_count: u32,
        compressor: &Compressor,
    ) -> Result<Self> {
        let entries: Vec<U64> = read_table(
            storage,
            base,
            table_start,
            inode_count as usize,
            EXPORT_ENTRIES_PER_BLOCK,
            compressor,
        )?;
        Ok(Self {
            refs: entries.iter().map(|e| InodeRef(e.get())).collect(),
        })
    }

    /// Inode numbers start at 1.
    pub fn inode_ref(&self, inode_number: u32) -> Result<InodeRef> {
        inode_number
            .checked_sub(1)
            .and_then(|i| self.refs.get(i as usize))
            .copied()
            .ok_or(SquashError::Corrupt("inode number out of export range"))
    }
}

/// Encodes the export table from inode refs indexed by inode number − 1.
pub fn encode_export_table(
    refs: &[InodeRef],
    compressor: &Compressor,
) -> Result<(Vec<u8>, Vec<u32>)> {
    let entries: Vec<U64> = refs.iter().map(|r| U64::from(r.0)).collect();
    encode_table(&entries, EXPORT_ENTRIES_PER_BLOCK, compressor)
}

/// Writes an encoded table's metadata stream followed by its pointer array.
/// `position` is the image-relative offset the stream lands at; returns the
/// image-relative offset of the pointer array.
pub fn write_encoded_table(
    out: &mut impl Write,
    position: u64,
    encoded: &[u8],
    locations: &[u32],
) -> Result<u64> {
    out.write_all(encoded)?;
    let table_start = position + encoded.len() as u64;
    for &location in locations {
        out.write_all(&(position + location as u64).to_le_bytes())?;
    }
    Ok(table_start)
}
