//! SquashFS on-disk format definitions.
//!
//! This module defines the binary layout of the superblock, inode records,
//! directory records and table entries using zerocopy-based parsing.  All of
//! the structures are defined in terms of pure LE integer sizes; conversion
//! to richer types happens in the owning modules.

use std::fmt;

use zerocopy::{
    little_endian::{I16, U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{Result, SquashError};

pub const MAGIC: u32 = 0x73717368; // "hsqs"
pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;

pub const METADATA_BLOCK_SIZE: usize = 8192;
pub const METADATA_UNCOMPRESSED_FLAG: u16 = 0x8000;

pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// The image is zero-padded to a multiple of this.
pub const PAD_SIZE: u64 = 4096;

/// Stored-size entries for data blocks and fragment blocks carry this bit
/// when the block is stored uncompressed.
pub const DATA_BLOCK_UNCOMPRESSED_FLAG: u32 = 1 << 24;

/// "No fragment" sentinel in file inodes.
pub const FRAGMENT_ABSENT: u32 = !0;
/// "No xattrs" sentinel in extended inodes.
pub const XATTR_ABSENT: u32 = !0;
/// Sentinel start offset for tables that are not present.
pub const TABLE_ABSENT: u64 = !0;

/// The directory inode's stored file size exceeds the encoded listing by
/// this fixed bias.
pub const DIRECTORY_SIZE_BIAS: u32 = 3;
/// One directory header covers at most this many entries.
pub const DIRECTORY_MAX_ENTRIES: usize = 256;

/* Superblock flags */
pub const FLAG_UNCOMPRESSED_INODES: u16 = 0x0001;
pub const FLAG_UNCOMPRESSED_DATA: u16 = 0x0002;
pub const FLAG_UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
pub const FLAG_NO_FRAGMENTS: u16 = 0x0010;
pub const FLAG_ALWAYS_FRAGMENTS: u16 = 0x0020;
pub const FLAG_DUPLICATES: u16 = 0x0040;
pub const FLAG_EXPORTABLE: u16 = 0x0080;
pub const FLAG_UNCOMPRESSED_XATTRS: u16 = 0x0100;
pub const FLAG_NO_XATTRS: u16 = 0x0200;
pub const FLAG_COMPRESSOR_OPTIONS: u16 = 0x0400;
pub const FLAG_UNCOMPRESSED_IDS: u16 = 0x0800;

/// Fixed 96-byte record at offset 0 of every image.  Written twice by the
/// writer: once as an all-zero placeholder, once with final values after
/// every table offset is known.
#[derive(Clone, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Superblock {
    pub magic: U32,
    pub inode_count: U32,
    pub modification_time: U32,
    pub block_size: U32,

    pub fragment_count: U32,
    pub compression_id: U16,
    pub block_log: U16,
    pub flags: U16,
    pub id_count: U16,
    pub version_major: U16,
    pub version_minor: U16,

    pub root_inode_ref: U64,
    pub bytes_used: U64,
    pub id_table_start: U64,
    pub xattr_table_start: U64,
    pub inode_table_start: U64,
    pub directory_table_start: U64,
    pub fragment_table_start: U64,
    pub export_table_start: U64,
}

pub const SUPERBLOCK_SIZE: usize = std::mem::size_of::<Superblock>();

impl Superblock {
    pub fn validate(&self) -> Result<()> {
        if self.magic.get() != MAGIC {
            return Err(SquashError::BadMagic(self.magic.get()));
        }
        if self.version_major.get() != VERSION_MAJOR
            || self.version_minor.get() != VERSION_MINOR
        {
            return Err(SquashError::UnsupportedVersion(
                self.version_major.get(),
                self.version_minor.get(),
            ));
        }
        let block_size = self.block_size.get();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
            || 1u32 << self.block_log.get() != block_size
        {
            return Err(SquashError::InvalidBlockSize(block_size));
        }
        Ok(())
    }

    pub fn has_export_table(&self) -> bool {
        self.export_table_start.get() != TABLE_ABSENT
    }
}

impl fmt::Debug for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Superblock")
            .field("inode_count", &self.inode_count.get())
            .field("modification_time", &self.modification_time.get())
            .field("block_size", &self.block_size.get())
            .field("fragment_count", &self.fragment_count.get())
            .field("compression_id", &self.compression_id.get())
            .field("flags", &format_args!("{:#06x}", self.flags.get()))
            .field("id_count", &self.id_count.get())
            .field("root_inode_ref", &InodeRef(self.root_inode_ref.get()))
            .field("bytes_used", &self.bytes_used.get())
            .finish_non_exhaustive()
    }
}

/// 64-bit reference to one inode record: the byte offset of its metadata
/// block relative to the inode table start in the high bits, the byte offset
/// within the decompressed block in the low 16.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef(pub u64);

impl InodeRef {
    pub fn new(location: u32, offset: u16) -> Self {
        Self((location as u64) << 16 | offset as u64)
    }

    pub fn location(self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ location={}, offset={} }}", self.location(), self.offset())
    }
}

/* Inode records */

/// Inode type tags.  Extended variants are the basic tag plus
/// [`INODE_TYPE_EXTENDED_OFFSET`].
pub const INODE_TYPE_DIRECTORY: u16 = 1;
pub const INODE_TYPE_FILE: u16 = 2;
pub const INODE_TYPE_SYMLINK: u16 = 3;
pub const INODE_TYPE_BLOCK_DEVICE: u16 = 4;
pub const INODE_TYPE_CHAR_DEVICE: u16 = 5;
pub const INODE_TYPE_FIFO: u16 = 6;
pub const INODE_TYPE_SOCKET: u16 = 7;
pub const INODE_TYPE_EXTENDED_OFFSET: u16 = 7;

pub const INODE_TYPE_EXTENDED_DIRECTORY: u16 = INODE_TYPE_DIRECTORY + INODE_TYPE_EXTENDED_OFFSET;
pub const INODE_TYPE_EXTENDED_FILE: u16 = INODE_TYPE_FILE + INODE_TYPE_EXTENDED_OFFSET;
pub const INODE_TYPE_EXTENDED_SYMLINK: u16 = INODE_TYPE_SYMLINK + INODE_TYPE_EXTENDED_OFFSET;
pub const INODE_TYPE_EXTENDED_BLOCK_DEVICE: u16 =
    INODE_TYPE_BLOCK_DEVICE + INODE_TYPE_EXTENDED_OFFSET;
pub const INODE_TYPE_EXTENDED_CHAR_DEVICE: u16 =
    INODE_TYPE_CHAR_DEVICE + INODE_TYPE_EXTENDED_OFFSET;
pub const INODE_TYPE_EXTENDED_FIFO: u16 = INODE_TYPE_FIFO + INODE_TYPE_EXTENDED_OFFSET;
pub const INODE_TYPE_EXTENDED_SOCKET: u16 = INODE_TYPE_SOCKET + INODE_TYPE_EXTENDED_OFFSET;

/// 16-byte header common to every inode record.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct InodeHeader {
    pub inode_type: U16,
    pub permissions: U16,
    pub uid_idx: U16,
    pub gid_idx: U16,
    pub modified_time: U32,
    pub inode_number: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BasicDirectoryRecord {
    pub start_block: U32,
    pub nlink: U32,
    pub file_size: U16,
    pub offset: U16,
    pub parent_inode: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtendedDirectoryRecord {
    pub nlink: U32,
    pub file_size: U32,
    pub start_block: U32,
    pub parent_inode: U32,
    pub index_count: U16,
    pub offset: U16,
    pub xattr_idx: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BasicFileRecord {
    pub start_block: U32,
    pub fragment_index: U32,
    pub fragment_offset: U32,
    pub file_size: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtendedFileRecord {
    pub start_block: U64,
    pub file_size: U64,
    pub sparse: U64,
    pub nlink: U32,
    pub fragment_index: U32,
    pub fragment_offset: U32,
    pub xattr_idx: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SymlinkRecord {
    pub nlink: U32,
    pub target_size: U32,
    // target bytes follow; extended variants append a U32 xattr index
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BasicDeviceRecord {
    pub nlink: U32,
    pub device: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtendedDeviceRecord {
    pub nlink: U32,
    pub device: U32,
    pub xattr_idx: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BasicIpcRecord {
    pub nlink: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtendedIpcRecord {
    pub nlink: U32,
    pub xattr_idx: U32,
}

/* Directory records */

/// Fixed part of a directory header; `count` is stored as entries − 1.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryHeaderRecord {
    pub count: U32,
    pub start_block: U32,
    pub inode_number: U32,
}

/// Fixed part of a directory entry; the name follows, `name_size` bytes + 1
/// long.  `inode_delta` is signed, relative to the header's inode number.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryEntryRecord {
    pub offset: U16,
    pub inode_delta: I16,
    pub entry_type: U16,
    pub name_size: U16,
}

/* Tables */

/// One fragment-table record per fragment block, in creation order.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FragmentEntry {
    pub start: U64,
    pub size: U32,
    pub unused: U32,
}

impl FragmentEntry {
    pub fn new(start: u64, stored_size: u32, compressed: bool) -> Self {
        let size = if compressed {
            stored_size
        } else {
            stored_size | DATA_BLOCK_UNCOMPRESSED_FLAG
        };
        Self {
            start: start.into(),
            size: size.into(),
            unused: 0.into(),
        }
    }

    pub fn stored_size(&self) -> u32 {
        self.size.get() & !DATA_BLOCK_UNCOMPRESSED_FLAG
    }

    pub fn is_compressed(&self) -> bool {
        self.size.get() & DATA_BLOCK_UNCOMPRESSED_FLAG == 0
    }
}

/// One entry of a file inode's block-pointer list.
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct BlockSize(pub U32);

impl BlockSize {
    pub fn new(stored_size: u32, compressed: bool) -> Self {
        if compressed {
            Self(stored_size.into())
        } else {
            Self((stored_size | DATA_BLOCK_UNCOMPRESSED_FLAG).into())
        }
    }

    pub fn sparse() -> Self {
        Self(0.into())
    }

    pub fn is_sparse(self) -> bool {
        self.0.get() == 0
    }

    pub fn stored_size(self) -> u32 {
        self.0.get() & !DATA_BLOCK_UNCOMPRESSED_FLAG
    }

    pub fn is_compressed(self) -> bool {
        !self.is_sparse() && self.0.get() & DATA_BLOCK_UNCOMPRESSED_FLAG == 0
    }
}

impl fmt::Debug for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_sparse() {
            write!(f, "sparse")
        } else {
            write!(
                f,
                "{} bytes{}",
                self.stored_size(),
                if self.is_compressed() { "" } else { " (raw)" }
            )
        }
    }
}

/// Linux rdev packing used by device inodes.
pub fn encode_device(major: u32, minor: u32) -> u32 {
    (major & 0xfff) << 8 | (minor & 0xff) | (minor & !0xff) << 12
}

pub fn device_major(device: u32) -> u32 {
    (device >> 8) & 0xfff
}

pub fn device_minor(device: u32) -> u32 {
    (device & 0xff) | ((device >> 12) & !0xff)
}
