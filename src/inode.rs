//! In-memory inode model.
//!
//! Every inode kind comes in a basic and an extended on-disk shape.  The
//! in-memory form always carries the extended capabilities (wide sizes,
//! sparse byte count, explicit link count) plus an `extended` flag that
//! selects the shape to serialize.  [`Inode::simplify`] downgrades an
//! extended inode to the basic shape when nothing would be lost, which is
//! what the writer does for every inode before serializing.

use crate::{
    format::{
        BasicDeviceRecord, BasicDirectoryRecord, BasicFileRecord, BasicIpcRecord, BlockSize,
        ExtendedDeviceRecord, ExtendedDirectoryRecord, ExtendedFileRecord, ExtendedIpcRecord,
        InodeHeader, SymlinkRecord, FRAGMENT_ABSENT, INODE_TYPE_BLOCK_DEVICE,
        INODE_TYPE_CHAR_DEVICE, INODE_TYPE_DIRECTORY, INODE_TYPE_EXTENDED_BLOCK_DEVICE,
        INODE_TYPE_EXTENDED_CHAR_DEVICE, INODE_TYPE_EXTENDED_DIRECTORY,
        INODE_TYPE_EXTENDED_FIFO, INODE_TYPE_EXTENDED_FILE, INODE_TYPE_EXTENDED_OFFSET,
        INODE_TYPE_EXTENDED_SOCKET, INODE_TYPE_EXTENDED_SYMLINK, INODE_TYPE_FIFO,
        INODE_TYPE_FILE, INODE_TYPE_SOCKET, INODE_TYPE_SYMLINK, XATTR_ABSENT,
    },
    io::ReadAt,
    metadata::{MetadataReader, MetadataWriter},
    Result, SquashError,
};

use zerocopy::little_endian::U32;

/// Fields shared by every inode kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeBase {
    pub permissions: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub modified_time: u32,
    pub inode_number: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryInode {
    pub base: InodeBase,
    pub extended: bool,
    /// Listing position within the directory table.
    pub start_block: u32,
    pub offset: u16,
    /// Encoded listing length plus the fixed bias of 3.
    pub file_size: u32,
    pub nlink: u32,
    pub parent_inode: u32,
    pub xattr_idx: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInode {
    pub base: InodeBase,
    pub extended: bool,
    /// Absolute offset of the first data block, 0 for fragment-only files.
    pub start_block: u64,
    pub file_size: u64,
    /// Bytes represented by sparse block entries.
    pub sparse: u64,
    pub nlink: u32,
    /// Fragment table index and byte offset within the fragment block.
    pub fragment: Option<(u32, u32)>,
    pub xattr_idx: u32,
    pub block_sizes: Vec<BlockSize>,
}

impl FileInode {
    /// Number of full data blocks, given the fragment flag already encoded
    /// in `fragment`.
    pub fn block_count(file_size: u64, block_size: u32, has_fragment: bool) -> usize {
        if has_fragment {
            (file_size / block_size as u64) as usize
        } else {
            (file_size.div_ceil(block_size as u64)) as usize
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymlinkInode {
    pub base: InodeBase,
    pub extended: bool,
    pub nlink: u32,
    pub target: Vec<u8>,
    pub xattr_idx: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInode {
    pub base: InodeBase,
    pub extended: bool,
    pub nlink: u32,
    /// Packed rdev, see [`crate::format::encode_device`].
    pub device: u32,
    pub xattr_idx: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcInode {
    pub base: InodeBase,
    pub extended: bool,
    pub nlink: u32,
    pub xattr_idx: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inode {
    Directory(DirectoryInode),
    File(FileInode),
    Symlink(SymlinkInode),
    BlockDevice(DeviceInode),
    CharDevice(DeviceInode),
    Fifo(IpcInode),
    Socket(IpcInode),
}

impl Inode {
    pub fn base(&self) -> &InodeBase {
        match self {
            Inode::Directory(i) => &i.base,
            Inode::File(i) => &i.base,
            Inode::Symlink(i) => &i.base,
            Inode::BlockDevice(i) | Inode::CharDevice(i) => &i.base,
            Inode::Fifo(i) | Inode::Socket(i) => &i.base,
        }
    }

    pub fn inode_number(&self) -> u32 {
        self.base().inode_number
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Inode::Directory(_))
    }

    pub fn is_extended(&self) -> bool {
        match self {
            Inode::Directory(i) => i.extended,
            Inode::File(i) => i.extended,
            Inode::Symlink(i) => i.extended,
            Inode::BlockDevice(i) | Inode::CharDevice(i) => i.extended,
            Inode::Fifo(i) | Inode::Socket(i) => i.extended,
        }
    }

    /// The tag of the basic shape, which doubles as the directory entry type.
    pub fn basic_type_tag(&self) -> u16 {
        match self {
            Inode::Directory(_) => INODE_TYPE_DIRECTORY,
            Inode::File(_) => INODE_TYPE_FILE,
            Inode::Symlink(_) => INODE_TYPE_SYMLINK,
            Inode::BlockDevice(_) => INODE_TYPE_BLOCK_DEVICE,
            Inode::CharDevice(_) => INODE_TYPE_CHAR_DEVICE,
            Inode::Fifo(_) => INODE_TYPE_FIFO,
            Inode::Socket(_) => INODE_TYPE_SOCKET,
        }
    }

    pub fn type_tag(&self) -> u16 {
        let tag = self.basic_type_tag();
        if self.is_extended() {
            tag + INODE_TYPE_EXTENDED_OFFSET
        } else {
            tag
        }
    }

    /// Downgrades to the basic on-disk shape when it can represent this
    /// inode exactly.
    pub fn simplify(&mut self) {
        match self {
            Inode::Directory(i) => {
                if i.xattr_idx == XATTR_ABSENT && i.file_size <= u16::MAX as u32 {
                    i.extended = false;
                }
            }
            Inode::File(i) => {
                // the basic file record has no nlink or sparse fields and
                // 32-bit size and start offset
                if i.xattr_idx == XATTR_ABSENT
                    && i.nlink == 1
                    && i.sparse == 0
                    && i.start_block <= u32::MAX as u64
                    && i.file_size <= u32::MAX as u64
                {
                    i.extended = false;
                }
            }
            Inode::Symlink(i) => {
                if i.xattr_idx == XATTR_ABSENT {
                    i.extended = false;
                }
            }
            Inode::BlockDevice(i) | Inode::CharDevice(i) => {
                if i.xattr_idx == XATTR_ABSENT {
                    i.extended = false;
                }
            }
            Inode::Fifo(i) | Inode::Socket(i) => {
                if i.xattr_idx == XATTR_ABSENT {
                    i.extended = false;
                }
            }
        }
    }

    /// Decodes one inode record from the cursor, which must be positioned at
    /// its header.
    pub fn read<R: ReadAt + ?Sized>(
        reader: &mut MetadataReader<'_, R>,
        block_size: u32,
    ) -> Result<Self> {
        let header: InodeHeader = reader.read_struct()?;
        let base = InodeBase {
            permissions: header.permissions.get(),
            uid_idx: header.uid_idx.get(),
            gid_idx: header.gid_idx.get(),
            modified_time: header.modified_time.get(),
            inode_number: header.inode_number.get(),
        };

        let inode = match header.inode_type.get() {
            INODE_TYPE_DIRECTORY => {
                let rec: BasicDirectoryRecord = reader.read_struct()?;
                Inode::Directory(DirectoryInode {
                    base,
                    extended: false,
                    start_block: rec.start_block.get(),
                    offset: rec.offset.get(),
                    file_size: rec.file_size.get() as u32,
                    nlink: rec.nlink.get(),
                    parent_inode: rec.parent_inode.get(),
                    xattr_idx: XATTR_ABSENT,
                })
            }
            INODE_TYPE_EXTENDED_DIRECTORY => {
                let rec: ExtendedDirectoryRecord = reader.read_struct()?;
                // skip the optional lookup index entries
                for _ in 0..rec.index_count.get() {
                    reader.skip(4 + 4)?;
                    let name_size: U32 = reader.read_struct()?;
                    reader.skip(name_size.get() as usize + 1)?;
                }
                Inode::Directory(DirectoryInode {
                    base,
                    extended: true,
                    start_block: rec.start_block.get(),
                    offset: rec.offset.get(),
                    file_size: rec.file_size.get(),
                    nlink: rec.nlink.get(),
                    parent_inode: rec.parent_inode.get(),
                    xattr_idx: rec.xattr_idx.get(),
                })
            }
            INODE_TYPE_FILE => {
                let rec: BasicFileRecord = reader.read_struct()?;
                let fragment = if rec.fragment_index.get() == FRAGMENT_ABSENT {
                    None
                } else {
                    Some((rec.fragment_index.get(), rec.fragment_offset.get()))
                };
                let file_size = rec.file_size.get() as u64;
                let count = FileInode::block_count(file_size, block_size, fragment.is_some());
                let mut block_sizes = Vec::with_capacity(count);
                for _ in 0..count {
                    block_sizes.push(reader.read_struct::<BlockSize>()?);
                }
                Inode::File(FileInode {
                    base,
                    extended: false,
                    start_block: rec.start_block.get() as u64,
                    file_size,
                    sparse: 0,
                    nlink: 1,
                    fragment,
                    xattr_idx: XATTR_ABSENT,
                    block_sizes,
                })
            }
            INODE_TYPE_EXTENDED_FILE => {
                let rec: ExtendedFileRecord = reader.read_struct()?;
                let fragment = if rec.fragment_index.get() == FRAGMENT_ABSENT {
                    None
                } else {
                    Some((rec.fragment_index.get(), rec.fragment_offset.get()))
                };
                let file_size = rec.file_size.get();
                let count = FileInode::block_count(file_size, block_size, fragment.is_some());
                let mut block_sizes = Vec::with_capacity(count);
                for _ in 0..count {
                    block_sizes.push(reader.read_struct::<BlockSize>()?);
                }
                Inode::File(FileInode {
                    base,
                    extended: true,
                    start_block: rec.start_block.get(),
                    file_size,
                    sparse: rec.sparse.get(),
                    nlink: rec.nlink.get(),
                    fragment,
                    xattr_idx: rec.xattr_idx.get(),
                    block_sizes,
                })
            }
            t @ (INODE_TYPE_SYMLINK | INODE_TYPE_EXTENDED_SYMLINK) => {
                let rec: SymlinkRecord = reader.read_struct()?;
                let target = reader.read_vec(rec.target_size.get() as usize)?;
                let extended = t != INODE_TYPE_SYMLINK;
                let xattr_idx = if extended {
                    reader.read_struct::<U32>()?.get()
                } else {
                    XATTR_ABSENT
                };
                Inode::Symlink(SymlinkInode {
                    base,
                    extended,
                    nlink: rec.nlink.get(),
                    target,
                    xattr_idx,
                })
            }
            t @ (INODE_TYPE_BLOCK_DEVICE | INODE_TYPE_CHAR_DEVICE) => {
                let rec: BasicDeviceRecord = reader.read_struct()?;
                let inode = DeviceInode {
                    base,
                    extended: false,
                    nlink: rec.nlink.get(),
                    device: rec.device.get(),
                    xattr_idx: XATTR_ABSENT,
                };
                if t == INODE_TYPE_BLOCK_DEVICE {
                    Inode::BlockDevice(inode)
                } else {
                    Inode::CharDevice(inode)
                }
            }
            t @ (INODE_TYPE_EXTENDED_BLOCK_DEVICE | INODE_TYPE_EXTENDED_CHAR_DEVICE) => {
                let rec: ExtendedDeviceRecord = reader.read_struct()?;
                let inode = DeviceInode {
                    base,
                    extended: true,
                    nlink: rec.nlink.get(),
                    device: rec.device.get(),
                    xattr_idx: rec.xattr_idx.get(),
                };
                if t == INODE_TYPE_EXTENDED_BLOCK_DEVICE {
                    Inode::BlockDevice(inode)
                } else {
                    Inode::CharDevice(inode)
                }
            }
            t @ (INODE_TYPE_FIFO | INODE_TYPE_SOCKET) => {
                let rec: BasicIpcRecord = reader.read_struct()?;
                let inode = IpcInode {
                    base,
                    extended: false,
                    nlink: rec.nlink.get(),
                    xattr_idx: XATTR_ABSENT,
                };
                if t == INODE_TYPE_FIFO {
                    Inode::Fifo(inode)
                } else {
                    Inode::Socket(inode)
                }
            }
            t @ (INODE_TYPE_EXTENDED_FIFO | INODE_TYPE_EXTENDED_SOCKET) => {
                let rec: ExtendedIpcRecord = reader.read_struct()?;
                let inode = IpcInode {
                    base,
                    extended: true,
                    nlink: rec.nlink.get(),
                    xattr_idx: rec.xattr_idx.get(),
                };
                if t == INODE_TYPE_EXTENDED_FIFO {
                    Inode::Fifo(inode)
                } else {
                    Inode::Socket(inode)
                }
            }
            other => return Err(SquashError::UnknownInodeType(other)),
        };
        Ok(inode)
    }

    /// Serializes this inode at the writer's current position.
    pub fn write(&self, w: &mut MetadataWriter) -> Result<()> {
        let base = self.base();
        w.write_struct(InodeHeader {
            inode_type: self.type_tag().into(),
            permissions: base.permissions.into(),
            uid_idx: base.uid_idx.into(),
            gid_idx: base.gid_idx.into(),
            modified_time: base.modified_time.into(),
            inode_number: base.inode_number.into(),
        })?;

        match self {
            Inode::Directory(i) if !i.extended => w.write_struct(BasicDirectoryRecord {
                start_block: i.start_block.into(),
                nlink: i.nlink.into(),
                file_size: (i.file_size as u16).into(),
                offset: i.offset.into(),
                parent_inode: i.parent_inode.into(),
            }),
            Inode::Directory(i) => w.write_struct(ExtendedDirectoryRecord {
                nlink: i.nlink.into(),
                file_size: i.file_size.into(),
                start_block: i.start_block.into(),
                parent_inode: i.parent_inode.into(),
                index_count: 0.into(),
                offset: i.offset.into(),
                xattr_idx: i.xattr_idx.into(),
            }),
            Inode::File(i) => {
                let (fragment_index, fragment_offset) = i.fragment.unwrap_or((FRAGMENT_ABSENT, 0));
                if i.extended {
                    w.write_struct(ExtendedFileRecord {
                        start_block: i.start_block.into(),
                        file_size: i.file_size.into(),
                        sparse: i.sparse.into(),
                        nlink: i.nlink.into(),
                        fragment_index: fragment_index.into(),
                        fragment_offset: fragment_offset.into(),
                        xattr_idx: i.xattr_idx.into(),
                    })?;
                } else {
                    w.write_struct(BasicFileRecord {
                        start_block: (i.start_block as u32).into(),
                        fragment_index: fragment_index.into(),
                        fragment_offset: fragment_offset.into(),
                        file_size: (i.file_size as u32).into(),
                    })?;
                }
                for size in &i.block_sizes {
                    w.write_struct(*size)?;
                }
                Ok(())
            }
            Inode::Symlink(i) => {
                w.write_struct(SymlinkRecord {
                    nlink: i.nlink.into(),
                    target_size: (i.target.len() as u32).into(),
                })?;
                w.write(&i.target)?;
                if i.extended {
                    w.write_struct(U32::from(i.xattr_idx))?;
                }
                Ok(())
            }
            Inode::BlockDevice(i) | Inode::CharDevice(i) => {
                if i.extended {
                    w.write_struct(ExtendedDeviceRecord {
                        nlink: i.nlink.into(),
                        device: i.device.into(),
                        xattr_idx: i.xattr_idx.into(),
                    })
                } else {
                    w.write_struct(BasicDeviceRecord {
                        nlink: i.nlink.into(),
                        device: i.device.into(),
                    })
                }
            }
            Inode::Fifo(i) | Inode::Socket(i) => {
                if i.extended {
                    w.write_struct(ExtendedIpcRecord {
                        nlink: i.nlink.into(),
                        xattr_idx: i.xattr_idx.into(),
                    })
                } else {
                    w.write_struct(BasicIpcRecord { nlink: i.nlink.into() })
                }
            }
        }
    }
}
