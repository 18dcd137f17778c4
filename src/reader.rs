//! Image reader.
//!
//! A reader validates the superblock once at open time and loads the id,
//! fragment and export tables eagerly (they are small).  Inode records and
//! directory listings are decoded on demand through per-reader block caches;
//! the storage itself is never seeked, so several readers can share one
//! `&[u8]` or `File` backing.

use std::io::Write;

use log::debug;
use zerocopy::FromBytes;

use crate::{
    compression::{CompressionId, Compressor},
    data::{read_data_block, read_fragment_block},
    directory::{find_entry, read_listing, DirectoryEntry},
    format::{BlockSize, InodeRef, Superblock, DIRECTORY_SIZE_BIAS, SUPERBLOCK_SIZE},
    inode::{FileInode, Inode},
    io::ReadAt,
    metadata::{BlockCache, CachePolicy, MetadataBlock, MetadataReader},
    table::{ExportTable, FragmentTable, IdTable},
    tree::normalize_path,
    Result, SquashError,
};

/// An opened image.
pub struct SquashReader<R: ReadAt> {
    storage: R,
    /// Offset of the superblock within the storage.
    base: u64,
    superblock: Superblock,
    compressor: Compressor,
    metadata_cache: BlockCache<MetadataBlock>,
    data_cache: BlockCache<Vec<u8>>,
    fragment_cache: BlockCache<Vec<u8>>,
    id_table: IdTable,
    fragment_table: FragmentTable,
    export_table: Option<ExportTable>,
}

impl<R: ReadAt> SquashReader<R> {
    /// Opens an image whose superblock sits at offset 0.
    pub fn open(storage: R) -> Result<Self> {
        Self::open_with(storage, 0, CachePolicy::default())
    }

    /// Opens an image embedded at `base`, with an explicit cache policy.
    pub fn open_with(storage: R, base: u64, cache_policy: CachePolicy) -> Result<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        storage.read_exact_at(base, &mut raw)?;
        // the buffer length matches the record exactly
        let superblock = Superblock::read_from_bytes(&raw).unwrap();
        superblock.validate()?;

        let compressor =
            Compressor::from_id(CompressionId::from_raw(superblock.compression_id.get())?);
        debug!(
            "opened image at base {base}: {superblock:?}, codec {:?}",
            compressor.id()
        );

        let id_table = IdTable::read(
            &storage,
            base,
            superblock.id_table_start.get(),
            superblock.id_count.get(),
            &compressor,
        )?;
        let fragment_table = if superblock.fragment_count.get() > 0 {
            FragmentTable::read(
                &storage,
                base,
                superblock.fragment_table_start.get(),
                superblock.fragment_count.get(),
                &compressor,
            )?
        } else {
            FragmentTable::empty()
        };
        let export_table = if superblock.has_export_table() {
            Some(ExportTable::read(
                &storage,
                base,
                superblock.export_table_start.get(),
                superblock.inode_count.get(),
                &compressor,
            )?)
        } else {
            None
        };

        Ok(Self {
            storage,
            base,
            superblock,
            compressor,
            metadata_cache: BlockCache::new(cache_policy),
            data_cache: BlockCache::new(cache_policy),
            fragment_cache: BlockCache::new(cache_policy),
            id_table,
            fragment_table,
            export_table,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size.get()
    }

    pub fn id_table(&self) -> &IdTable {
        &self.id_table
    }

    pub fn fragment_table(&self) -> &FragmentTable {
        &self.fragment_table
    }

    /// Present only when the image was written with an export table.
    pub fn export_table(&self) -> Option<&ExportTable> {
        self.export_table.as_ref()
    }

    pub fn uid_of(&self, inode: &Inode) -> Result<u32> {
        self.id_table.id(inode.base().uid_idx)
    }

    pub fn gid_of(&self, inode: &Inode) -> Result<u32> {
        self.id_table.id(inode.base().gid_idx)
    }

    fn metadata_reader(
        &self,
        table_start: u64,
        location: u32,
        offset: u16,
    ) -> Result<MetadataReader<'_, R>> {
        MetadataReader::new(
            &self.storage,
            &self.compressor,
            &self.metadata_cache,
            self.base + table_start + location as u64,
            offset,
        )
    }

    /// Decodes the inode behind a reference from the inode table.
    pub fn inode_at(&self, inode_ref: InodeRef) -> Result<Inode> {
        let mut reader = self.metadata_reader(
            self.superblock.inode_table_start.get(),
            inode_ref.location(),
            inode_ref.offset(),
        )?;
        Inode::read(&mut reader, self.block_size())
    }

    pub fn root_inode(&self) -> Result<Inode> {
        let inode = self.inode_at(InodeRef(self.superblock.root_inode_ref.get()))?;
        if !inode.is_directory() {
            return Err(SquashError::RootNotDirectory);
        }
        Ok(inode)
    }

    /// A positioned listing cursor, or `None` for an empty directory (whose
    /// listing occupies no bytes at all).
    fn listing_reader(&self, inode: &Inode) -> Result<Option<(MetadataReader<'_, R>, usize)>> {
        let Inode::Directory(dir) = inode else {
            return Err(SquashError::Corrupt("directory inode expected"));
        };
        let listing_bytes = dir
            .file_size
            .checked_sub(DIRECTORY_SIZE_BIAS)
            .ok_or(SquashError::Corrupt("directory size below fixed bias"))?;
        if listing_bytes == 0 {
            return Ok(None);
        }
        let reader = self.metadata_reader(
            self.superblock.directory_table_start.get(),
            dir.start_block,
            dir.offset,
        )?;
        Ok(Some((reader, listing_bytes as usize)))
    }

    /// All entries of a directory, in name order.
    pub fn children(&self, inode: &Inode) -> Result<Vec<DirectoryEntry>> {
        match self.listing_reader(inode)? {
            Some((mut reader, listing_bytes)) => read_listing(&mut reader, listing_bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Looks up one name in a directory, stopping early on the sorted
    /// listing.
    pub fn lookup(&self, inode: &Inode, name: &[u8]) -> Result<Option<DirectoryEntry>> {
        match self.listing_reader(inode)? {
            Some((mut reader, listing_bytes)) => find_entry(&mut reader, listing_bytes, name),
            None => Ok(None),
        }
    }

    /// Walks an absolute path from the root.  Symlinks are not followed;
    /// the final component's inode is returned as stored.
    pub fn resolve(&self, path: &str) -> Result<Inode> {
        let normalized = normalize_path(path)?;
        let mut inode = self.root_inode()?;
        for component in normalized.split('/').filter(|c| !c.is_empty()) {
            if !inode.is_directory() {
                return Err(SquashError::NotFound(path.to_string()));
            }
            let Some(entry) = self.lookup(&inode, component.as_bytes())? else {
                return Err(SquashError::NotFound(path.to_string()));
            };
            inode = self.inode_at(entry.inode_ref())?;
        }
        Ok(inode)
    }

    fn data_block(&self, offset: u64, size: BlockSize) -> Result<std::rc::Rc<Vec<u8>>> {
        self.data_cache.get_or_try_insert_with(offset, || {
            read_data_block(
                &self.storage,
                self.base + offset,
                size,
                &self.compressor,
                self.block_size(),
            )
        })
    }

    fn fragment_block(&self, index: u32) -> Result<std::rc::Rc<Vec<u8>>> {
        let entry = *self.fragment_table.entry(index)?;
        self.fragment_cache
            .get_or_try_insert_with(entry.start.get(), || {
                read_fragment_block(
                    &self.storage,
                    self.base,
                    &entry,
                    &self.compressor,
                    self.block_size(),
                )
            })
    }

    fn file_inode<'i>(&self, inode: &'i Inode) -> Result<&'i FileInode> {
        match inode {
            Inode::File(file) => Ok(file),
            _ => Err(SquashError::Corrupt("file inode expected")),
        }
    }

    /// Streams a file's full content to `out`, reconstructing sparse blocks
    /// as zeros.  Returns the byte count, which always equals the inode's
    /// size.
    pub fn read_file(&self, inode: &Inode, out: &mut impl Write) -> Result<u64> {
        let file = self.file_inode(inode)?;
        let block_size = self.block_size() as u64;
        let zeros = vec![0u8; self.block_size() as usize];

        let mut remaining = file.file_size;
        let mut disk_offset = file.start_block;
        for &size in &file.block_sizes {
            let logical = remaining.min(block_size) as usize;
            if size.is_sparse() {
                out.write_all(&zeros[..logical])?;
            } else {
                let data = self.data_block(disk_offset, size)?;
                if data.len() != logical {
                    return Err(SquashError::Corrupt("data block length mismatch"));
                }
                out.write_all(&data)?;
                disk_offset += size.stored_size() as u64;
            }
            remaining -= logical as u64;
        }

        if remaining > 0 {
            let Some((index, frag_offset)) = file.fragment else {
                return Err(SquashError::Corrupt("file size exceeds its blocks"));
            };
            let block = self.fragment_block(index)?;
            let start = frag_offset as usize;
            let end = start + remaining as usize;
            if end > block.len() {
                return Err(SquashError::Corrupt("fragment range out of bounds"));
            }
            out.write_all(&block[start..end])?;
        }
        Ok(file.file_size)
    }

    /// Reads part of a file into `buf`, starting at byte `offset`.  Returns
    /// the bytes copied, short only at end of file.
    pub fn read_range(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.file_inode(inode)?;
        if offset >= file.file_size {
            return Ok(0);
        }
        let block_size = self.block_size() as u64;
        let want = buf
            .len()
            .min((file.file_size - offset) as usize);
        let mut copied = 0usize;

        let mut logical_start = 0u64;
        let mut disk_offset = file.start_block;
        let mut remaining = file.file_size;
        for &size in &file.block_sizes {
            let logical = remaining.min(block_size);
            let logical_end = logical_start + logical;
            if copied < want && offset < logical_end && offset + want as u64 > logical_start {
                let from = offset.max(logical_start) - logical_start;
                let to = (offset + want as u64).min(logical_end) - logical_start;
                let dest = &mut buf[copied..copied + (to - from) as usize];
                if size.is_sparse() {
                    dest.fill(0);
                } else {
                    let data = self.data_block(disk_offset, size)?;
                    if data.len() != logical as usize {
                        return Err(SquashError::Corrupt("data block length mismatch"));
                    }
                    dest.copy_from_slice(&data[from as usize..to as usize]);
                }
                copied += (to - from) as usize;
            }
            if !size.is_sparse() {
                disk_offset += size.stored_size() as u64;
            }
            logical_start = logical_end;
            remaining -= logical;
        }

        if copied < want {
            let Some((index, frag_offset)) = file.fragment else {
                return Err(SquashError::Corrupt("file size exceeds its blocks"));
            };
            let block = self.fragment_block(index)?;
            let tail_pos = (offset + copied as u64 - logical_start) as usize;
            let start = frag_offset as usize + tail_pos;
            let end = start + (want - copied);
            if end > block.len() {
                return Err(SquashError::Corrupt("fragment range out of bounds"));
            }
            buf[copied..want].copy_from_slice(&block[start..end]);
            copied = want;
        }
        Ok(copied)
    }
}
