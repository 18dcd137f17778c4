//! Reading and writing SquashFS 4.0 filesystem images.
//!
//! The writer builds a complete image in one pass: entries are collected into
//! an in-memory tree, file content is compressed into data blocks and packed
//! tail fragments as it arrives, and `finish()` lays out the metadata tables
//! and backpatches the superblock.  The reader opens an existing image over
//! any [`ReadAt`] storage and resolves paths, lists directories and streams
//! file content back out.

use thiserror::Error;

pub mod compression;
pub mod data;
pub mod directory;
pub mod format;
pub mod inode;
pub mod io;
pub mod metadata;
pub mod reader;
pub mod table;
pub mod tree;
pub mod writer;

pub use crate::{
    compression::{CompressionId, Compressor},
    inode::Inode,
    io::ReadAt,
    metadata::CachePolicy,
    reader::SquashReader,
    writer::{EntryMeta, SquashWriter},
};

/// Errors raised while reading or writing a SquashFS image.
///
/// Format violations found while reading are fatal for that operation: a
/// corrupt image is never silently patched over.  Argument errors on the
/// writer side are raised before the offending entry commits any bytes, but
/// a failed build is not resumable and must restart from an empty writer.
#[derive(Debug, Error)]
pub enum SquashError {
    #[error("Bad magic 0x{0:08x} (expected 0x73717368)")]
    BadMagic(u32),
    #[error("Unsupported filesystem version {0}.{1}")]
    UnsupportedVersion(u16, u16),
    #[error("Invalid block size {0}")]
    InvalidBlockSize(u32),
    #[error("Unknown compression id {0}")]
    UnknownCompression(u16),
    #[error("Compression {0:?} is recognized but not implemented")]
    UnsupportedCompression(CompressionId),
    #[error("Metadata block at offset {0} is truncated or oversized")]
    CorruptMetadataBlock(u64),
    #[error("Unknown inode type tag {0}")]
    UnknownInodeType(u16),
    #[error("Directory listing read {read} bytes, expected {expected}")]
    DirectoryCountMismatch { read: usize, expected: usize },
    #[error("Archive corrupt: root inode is not a directory")]
    RootNotDirectory,
    #[error("Archive corrupt: {0}")]
    Corrupt(&'static str),
    #[error("Path {0:?} not found")]
    NotFound(String),
    #[error("Duplicate entry {0:?}")]
    DuplicateEntry(String),
    #[error("Invalid path {0:?}")]
    InvalidPath(String),
    #[error("Invalid permission bits 0o{0:o} (a mode carries at most 12)")]
    InvalidPermissions(u16),
    #[error("Missing parent directory for {0:?}")]
    MissingParent(String),
    #[error("Hardlink target {0:?} does not exist")]
    HardlinkTargetMissing(String),
    #[error("Hardlink target {0:?} is a directory")]
    HardlinkToDirectory(String),
    #[error("Declared file size {declared} but content was {actual} bytes")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("Invalid fragment length {0} (min 1, max {1})")]
    InvalidFragmentLength(usize, usize),
    #[error("Invalid data block length {0} (expected at most {1})")]
    InvalidBlockLength(usize, usize),
    #[error("Too many distinct ids (the id table holds at most 65535)")]
    IdTableFull,
    #[error("Writer already finished")]
    AlreadyFinished,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SquashError> = std::result::Result<T, E>;
