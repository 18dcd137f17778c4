//! One-pass image writer.
//!
//! Content is written as entries arrive: full blocks and flushed fragment
//! blocks land immediately after the (placeholder) superblock, in arrival
//! order.  Everything else is deferred to [`SquashWriter::finish`], which
//! lays out the metadata tables, pads the image and backpatches the real
//! superblock.  The output only needs to seek for that final backpatch, so
//! any `Write + Seek` sink works, including one positioned mid-file to embed
//! the image at a nonzero base.

use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;
use zerocopy::IntoBytes;

use crate::{
    compression::Compressor,
    data::FragmentWriter,
    format::{
        encode_device, Superblock, FLAG_DUPLICATES, FLAG_EXPORTABLE, FLAG_NO_XATTRS, MAGIC,
        MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, DEFAULT_BLOCK_SIZE, PAD_SIZE, SUPERBLOCK_SIZE,
        TABLE_ABSENT, VERSION_MAJOR, VERSION_MINOR,
    },
    table::{
        encode_export_table, encode_table, write_encoded_table, IdTableBuilder,
        FRAGMENT_ENTRIES_PER_BLOCK,
    },
    tree::{FsTree, NodeKind, NodeMeta},
    Result, SquashError,
};

/// Ownership and timestamp attributes for one entry.
#[derive(Clone, Copy, Debug)]
pub struct EntryMeta {
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    /// Seconds since the epoch.
    pub mtime: u32,
}

impl Default for EntryMeta {
    fn default() -> Self {
        Self {
            permissions: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }
}

/// Builds a complete image on a seekable sink.
pub struct SquashWriter<W: Write + Seek> {
    out: W,
    /// Absolute offset of the superblock within the sink.
    base: u64,
    /// Image-relative offset of the next write.
    position: u64,
    block_size: u32,
    compressor: Compressor,
    tree: FsTree,
    ids: IdTableBuilder,
    fragments: FragmentWriter,
    modification_time: Option<u32>,
    newest_mtime: u32,
    finished: bool,
}

impl<W: Write + Seek> SquashWriter<W> {
    pub fn new(out: W, compressor: Compressor) -> Result<Self> {
        Self::with_block_size(out, compressor, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(mut out: W, compressor: Compressor, block_size: u32) -> Result<Self> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            return Err(SquashError::InvalidBlockSize(block_size));
        }
        let base = out.stream_position()?;
        // placeholder superblock, rewritten by finish()
        out.write_all(&[0u8; SUPERBLOCK_SIZE])?;
        Ok(Self {
            out,
            base,
            position: SUPERBLOCK_SIZE as u64,
            block_size,
            compressor: compressor.clone(),
            tree: FsTree::new(),
            ids: IdTableBuilder::new(),
            fragments: FragmentWriter::new(block_size, compressor),
            modification_time: None,
            newest_mtime: 0,
            finished: false,
        })
    }

    /// Overrides the whole-image timestamp; by default the newest entry
    /// mtime is used.
    pub fn set_modification_time(&mut self, mtime: u32) {
        self.modification_time = Some(mtime);
    }

    /// Argument validation shared by every add operation.  Runs before any
    /// byte of the entry is committed, so a rejected entry leaves no trace
    /// in the image, the fragment buffer or the id table.
    fn check_entry(&self, path: &str, meta: &EntryMeta) -> Result<()> {
        if self.finished {
            return Err(SquashError::AlreadyFinished);
        }
        // only the type bits above the low 12 are invalid in a mode
        if meta.permissions & !0o7777 != 0 {
            return Err(SquashError::InvalidPermissions(meta.permissions));
        }
        self.tree.validate_new_entry(path)
    }

    fn node_meta(&mut self, meta: &EntryMeta) -> Result<NodeMeta> {
        self.newest_mtime = self.newest_mtime.max(meta.mtime);
        Ok(NodeMeta {
            permissions: meta.permissions,
            uid_idx: self.ids.intern(meta.uid)?,
            gid_idx: self.ids.intern(meta.gid)?,
            mtime: meta.mtime,
        })
    }

    pub fn add_directory(&mut self, path: &str, meta: &EntryMeta) -> Result<()> {
        self.check_entry(path, meta)?;
        let node_meta = self.node_meta(meta)?;
        self.tree.add(
            path,
            node_meta,
            NodeKind::Directory {
                children: Default::default(),
            },
        )
    }

    pub fn add_symlink(
        &mut self,
        path: &str,
        meta: &EntryMeta,
        target: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.check_entry(path, meta)?;
        let node_meta = self.node_meta(meta)?;
        self.tree.add(
            path,
            node_meta,
            NodeKind::Symlink {
                target: target.as_ref().to_vec(),
            },
        )
    }

    pub fn add_block_device(
        &mut self,
        path: &str,
        meta: &EntryMeta,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        self.check_entry(path, meta)?;
        let node_meta = self.node_meta(meta)?;
        self.tree.add(
            path,
            node_meta,
            NodeKind::BlockDevice {
                device: encode_device(major, minor),
            },
        )
    }

    pub fn add_char_device(
        &mut self,
        path: &str,
        meta: &EntryMeta,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        self.check_entry(path, meta)?;
        let node_meta = self.node_meta(meta)?;
        self.tree.add(
            path,
            node_meta,
            NodeKind::CharDevice {
                device: encode_device(major, minor),
            },
        )
    }

    pub fn add_fifo(&mut self, path: &str, meta: &EntryMeta) -> Result<()> {
        self.check_entry(path, meta)?;
        let node_meta = self.node_meta(meta)?;
        self.tree.add(path, node_meta, NodeKind::Fifo)
    }

    pub fn add_socket(&mut self, path: &str, meta: &EntryMeta) -> Result<()> {
        self.check_entry(path, meta)?;
        let node_meta = self.node_meta(meta)?;
        self.tree.add(path, node_meta, NodeKind::Socket)
    }

    pub fn add_hardlink(&mut self, path: &str, target: &str) -> Result<()> {
        if self.finished {
            return Err(SquashError::AlreadyFinished);
        }
        self.tree.add_hardlink(path, target)
    }

    /// Adds a regular file, streaming `content` into data blocks and a
    /// packed tail fragment.  When `declared_size` is given the content
    /// length is checked against it, eagerly enough that a mismatching
    /// tail never reaches a shared fragment block.
    pub fn add_file(
        &mut self,
        path: &str,
        meta: &EntryMeta,
        mut content: impl Read,
        declared_size: Option<u64>,
    ) -> Result<()> {
        self.check_entry(path, meta)?;

        let mut start_block = 0u64;
        let mut file_size = 0u64;
        let mut sparse = 0u64;
        let mut block_sizes = Vec::new();
        let mut fragment = None;
        let mut chunk = vec![0u8; self.block_size as usize];

        loop {
            let n = read_full(&mut content, &mut chunk)?;
            if n == 0 {
                break;
            }
            let total = file_size + n as u64;
            if let Some(declared) = declared_size {
                if total > declared {
                    return Err(SquashError::SizeMismatch {
                        declared,
                        actual: total,
                    });
                }
            }
            if n == chunk.len() {
                if block_sizes.is_empty() {
                    start_block = self.position;
                }
                let (size, emitted) = crate::data::write_data_block(
                    &mut self.out,
                    &self.compressor,
                    self.block_size,
                    &chunk,
                )?;
                if size.is_sparse() {
                    sparse += n as u64;
                }
                self.position += emitted;
                block_sizes.push(size);
                file_size = total;
            } else {
                // the stream ended on a short tail; settle the declared
                // size before the tail is committed to a shared fragment
                // block
                if let Some(declared) = declared_size {
                    if declared != total {
                        return Err(SquashError::SizeMismatch {
                            declared,
                            actual: total,
                        });
                    }
                }
                let (tail, emitted) =
                    self.fragments.write(&mut self.out, self.position, &chunk[..n])?;
                self.position += emitted;
                fragment = Some(tail);
                file_size = total;
                break;
            }
        }

        if let Some(declared) = declared_size {
            if declared != file_size {
                return Err(SquashError::SizeMismatch {
                    declared,
                    actual: file_size,
                });
            }
        }

        let node_meta = self.node_meta(meta)?;
        self.tree.add(
            path,
            node_meta,
            NodeKind::File {
                start_block,
                file_size,
                sparse,
                fragment,
                block_sizes,
            },
        )
    }

    /// Completes the image: flushes fragments, serializes the metadata
    /// tables, pads to 4 KiB and backpatches the superblock.  The sink is
    /// left positioned at the end of the image.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(SquashError::AlreadyFinished);
        }
        self.finished = true;

        self.position += self.fragments.flush(&mut self.out, self.position)?;

        let mtime = self.modification_time.unwrap_or(self.newest_mtime);
        let output = self.tree.build(&self.compressor, mtime)?;

        let inode_table_start = self.position;
        self.out.write_all(&output.inode_bytes)?;
        self.position += output.inode_bytes.len() as u64;

        let directory_table_start = self.position;
        self.out.write_all(&output.directory_bytes)?;
        self.position += output.directory_bytes.len() as u64;

        let fragment_entries = self.fragments.entries();
        let (encoded, locations) =
            encode_table(fragment_entries, FRAGMENT_ENTRIES_PER_BLOCK, &self.compressor)?;
        let fragment_table_start =
            write_encoded_table(&mut self.out, self.position, &encoded, &locations)?;
        self.position = fragment_table_start + 8 * locations.len() as u64;

        let (encoded, locations) = encode_export_table(&output.export_refs, &self.compressor)?;
        let export_table_start =
            write_encoded_table(&mut self.out, self.position, &encoded, &locations)?;
        self.position = export_table_start + 8 * locations.len() as u64;

        let (encoded, locations) = self.ids.encode(&self.compressor)?;
        let id_table_start =
            write_encoded_table(&mut self.out, self.position, &encoded, &locations)?;
        self.position = id_table_start + 8 * locations.len() as u64;

        let bytes_used = self.position;
        let padding = bytes_used.next_multiple_of(PAD_SIZE) - bytes_used;
        let zeros = [0u8; 512];
        let mut remaining = padding;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64);
            self.out.write_all(&zeros[..n as usize])?;
            remaining -= n;
        }
        self.position += padding;

        debug!(
            "image finished: {} inodes, {} fragments, tables at inode={inode_table_start} \
             directory={directory_table_start} fragment={fragment_table_start} \
             export={export_table_start} id={id_table_start}, {bytes_used} bytes used",
            output.inode_count,
            fragment_entries.len(),
        );

        let superblock = Superblock {
            magic: MAGIC.into(),
            inode_count: output.inode_count.into(),
            modification_time: mtime.into(),
            block_size: self.block_size.into(),
            fragment_count: (fragment_entries.len() as u32).into(),
            compression_id: (self.compressor.id() as u16).into(),
            block_log: (self.block_size.trailing_zeros() as u16).into(),
            flags: (FLAG_DUPLICATES | FLAG_EXPORTABLE | FLAG_NO_XATTRS).into(),
            id_count: self.ids.count().into(),
            version_major: VERSION_MAJOR.into(),
            version_minor: VERSION_MINOR.into(),
            root_inode_ref: output.root_ref.0.into(),
            bytes_used: bytes_used.into(),
            id_table_start: id_table_start.into(),
            xattr_table_start: TABLE_ABSENT.into(),
            inode_table_start: inode_table_start.into(),
            directory_table_start: directory_table_start.into(),
            fragment_table_start: fragment_table_start.into(),
            export_table_start: export_table_start.into(),
        };
        self.out.seek(SeekFrom::Start(self.base))?;
        self.out.write_all(superblock.as_bytes())?;
        self.out.seek(SeekFrom::Start(self.base + self.position))?;
        self.out.flush()?;
        Ok(())
    }

    /// Consumes the writer, returning the sink.
    pub fn into_inner(self) -> W {
        self.out
    }
}

fn read_full(source: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
