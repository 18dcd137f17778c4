//! In-memory filesystem tree built up by the writer.
//!
//! Entries are added in any order (parents first), indexed by normalized
//! absolute path.  `build` then assigns inode numbers in depth-first
//! pre-order from the root, serializes all non-directory inodes, and finally
//! serializes directory listings and directory inodes bottom-up so that
//! every listing only references already-written inode records.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::{
    compression::Compressor,
    data::FragmentRef,
    directory::DirectoryBuilder,
    format::{BlockSize, InodeRef, XATTR_ABSENT},
    inode::{
        DeviceInode, DirectoryInode, FileInode, Inode, InodeBase, IpcInode, SymlinkInode,
    },
    metadata::{MetadataRef, MetadataWriter},
    Result, SquashError,
};

/// Collapses repeated slashes and checks component validity.  Returns the
/// canonical form: leading `/`, no trailing slash, `/` for the root itself.
pub(crate) fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(SquashError::InvalidPath(path.to_string()));
    }
    let mut normalized = String::with_capacity(path.len());
    for component in path.split('/') {
        match component {
            "" => {}
            "." | ".." => return Err(SquashError::InvalidPath(path.to_string())),
            name => {
                normalized.push('/');
                normalized.push_str(name);
            }
        }
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct NodeMeta {
    pub permissions: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
}

pub(crate) enum NodeKind {
    Directory {
        children: BTreeMap<Vec<u8>, usize>,
    },
    File {
        start_block: u64,
        file_size: u64,
        sparse: u64,
        fragment: Option<FragmentRef>,
        block_sizes: Vec<BlockSize>,
    },
    Symlink {
        target: Vec<u8>,
    },
    BlockDevice {
        device: u32,
    },
    CharDevice {
        device: u32,
    },
    Fifo,
    Socket,
    /// Another directory entry for `target`'s inode.
    Hardlink {
        target: usize,
    },
}

pub(crate) struct Node {
    name: Vec<u8>,
    meta: NodeMeta,
    kind: NodeKind,
    inode_number: u32,
    /// Links added on top of the kind's baseline.
    extra_links: u32,
}

/// Everything the writer needs to lay the metadata tables out.
pub(crate) struct TreeOutput {
    pub inode_bytes: Vec<u8>,
    pub directory_bytes: Vec<u8>,
    pub root_ref: InodeRef,
    pub inode_count: u32,
    /// Inode refs indexed by inode number − 1, for the export table.
    pub export_refs: Vec<InodeRef>,
}

pub(crate) struct FsTree {
    nodes: Vec<Node>,
    by_path: HashMap<String, usize>,
}

impl FsTree {
    pub fn new() -> Self {
        let root = Node {
            name: Vec::new(),
            meta: NodeMeta {
                permissions: 0o755,
                uid_idx: 0,
                gid_idx: 0,
                mtime: 0,
            },
            kind: NodeKind::Directory {
                children: BTreeMap::new(),
            },
            inode_number: 0,
            extra_links: 0,
        };
        Self {
            nodes: vec![root],
            by_path: HashMap::from([("/".to_string(), 0)]),
        }
    }

    fn directory_children(&mut self, idx: usize) -> &mut BTreeMap<Vec<u8>, usize> {
        match &mut self.nodes[idx].kind {
            NodeKind::Directory { children } => children,
            _ => unreachable!("checked by caller"),
        }
    }

    /// Checks that `path` names a valid new entry: well formed, not taken,
    /// parent directory present.  Returns the canonical path and the parent
    /// node index.
    fn locate_parent(&self, path: &str) -> Result<(String, usize)> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(SquashError::InvalidPath(path));
        }
        if self.by_path.contains_key(&path) {
            return Err(SquashError::DuplicateEntry(path));
        }
        let split = path.rfind('/').unwrap();
        let parent_path = if split == 0 { "/" } else { &path[..split] };
        let parent = *self
            .by_path
            .get(parent_path)
            .ok_or_else(|| SquashError::MissingParent(path.clone()))?;
        if !matches!(self.nodes[parent].kind, NodeKind::Directory { .. }) {
            return Err(SquashError::MissingParent(path));
        }
        Ok((path, parent))
    }

    /// Validation only, for callers that need to reject an entry before
    /// committing any of its bytes.
    pub fn validate_new_entry(&self, path: &str) -> Result<()> {
        self.locate_parent(path).map(|_| ())
    }

    /// Adds one entry.  The parent directory must already exist.
    pub fn add(&mut self, path: &str, meta: NodeMeta, kind: NodeKind) -> Result<()> {
        let (path, parent) = self.locate_parent(path)?;
        let name = path[path.rfind('/').unwrap() + 1..].as_bytes().to_vec();

        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: name.clone(),
            meta,
            kind,
            inode_number: 0,
            extra_links: 0,
        });
        self.directory_children(parent).insert(name, idx);
        self.by_path.insert(path, idx);
        Ok(())
    }

    /// Adds a hardlink: a second directory entry for an existing
    /// non-directory entry.
    pub fn add_hardlink(&mut self, path: &str, target: &str) -> Result<()> {
        let target_path = normalize_path(target)?;
        let mut target_idx = *self
            .by_path
            .get(&target_path)
            .ok_or_else(|| SquashError::HardlinkTargetMissing(target_path.clone()))?;
        // chase links so chains all share one inode
        while let NodeKind::Hardlink { target } = self.nodes[target_idx].kind {
            target_idx = target;
        }
        if matches!(self.nodes[target_idx].kind, NodeKind::Directory { .. }) {
            return Err(SquashError::HardlinkToDirectory(target_path));
        }
        let meta = self.nodes[target_idx].meta;
        self.add(path, meta, NodeKind::Hardlink { target: target_idx })?;
        self.nodes[target_idx].extra_links += 1;
        Ok(())
    }

    /// Real (inode-carrying) nodes in depth-first pre-order, directories
    /// descending by sorted child name.
    fn inode_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            if let NodeKind::Directory { children } = &self.nodes[idx].kind {
                for &child in children.values().rev() {
                    if !matches!(self.nodes[child].kind, NodeKind::Hardlink { .. }) {
                        stack.push(child);
                    }
                }
            }
        }
        order
    }

    fn nlink(&self, idx: usize) -> u32 {
        let node = &self.nodes[idx];
        let baseline = match &node.kind {
            NodeKind::Directory { children } => {
                2 + children
                    .values()
                    .filter(|&&c| matches!(self.nodes[c].kind, NodeKind::Directory { .. }))
                    .count() as u32
            }
            _ => 1,
        };
        baseline + node.extra_links
    }

    fn make_inode(&self, idx: usize, nlink: u32) -> Inode {
        let node = &self.nodes[idx];
        let base = InodeBase {
            permissions: node.meta.permissions,
            uid_idx: node.meta.uid_idx,
            gid_idx: node.meta.gid_idx,
            modified_time: node.meta.mtime,
            inode_number: node.inode_number,
        };
        match &node.kind {
            NodeKind::File {
                start_block,
                file_size,
                sparse,
                fragment,
                block_sizes,
            } => Inode::File(FileInode {
                base,
                extended: true,
                start_block: *start_block,
                file_size: *file_size,
                sparse: *sparse,
                nlink,
                // fragments are all flushed before serialization starts
                fragment: fragment.as_ref().map(|f| f.committed().unwrap()),
                xattr_idx: XATTR_ABSENT,
                block_sizes: block_sizes.clone(),
            }),
            NodeKind::Symlink { target } => Inode::Symlink(SymlinkInode {
                base,
                extended: true,
                nlink,
                target: target.clone(),
                xattr_idx: XATTR_ABSENT,
            }),
            NodeKind::BlockDevice { device } => Inode::BlockDevice(DeviceInode {
                base,
                extended: true,
                nlink,
                device: *device,
                xattr_idx: XATTR_ABSENT,
            }),
            NodeKind::CharDevice { device } => Inode::CharDevice(DeviceInode {
                base,
                extended: true,
                nlink,
                device: *device,
                xattr_idx: XATTR_ABSENT,
            }),
            NodeKind::Fifo => Inode::Fifo(IpcInode {
                base,
                extended: true,
                nlink,
                xattr_idx: XATTR_ABSENT,
            }),
            NodeKind::Socket => Inode::Socket(IpcInode {
                base,
                extended: true,
                nlink,
                xattr_idx: XATTR_ABSENT,
            }),
            NodeKind::Directory { .. } | NodeKind::Hardlink { .. } => {
                unreachable!("handled separately")
            }
        }
    }

    /// Serializes the whole tree into inode and directory metadata streams.
    pub fn build(
        &mut self,
        compressor: &Compressor,
        root_mtime: u32,
    ) -> Result<TreeOutput> {
        self.nodes[0].meta.mtime = root_mtime;

        let order = self.inode_order();
        let inode_count = order.len() as u32;
        for (i, &idx) in order.iter().enumerate() {
            self.nodes[idx].inode_number = i as u32 + 1;
        }
        debug!("serializing {inode_count} inodes");

        let mut inode_writer = MetadataWriter::new(compressor.clone());
        let mut dir_writer = MetadataWriter::new(compressor.clone());
        let mut refs: Vec<Option<MetadataRef>> = vec![None; self.nodes.len()];
        let mut export_refs = vec![InodeRef(0); inode_count as usize];

        // all non-directory inodes first, so directory listings and the
        // directory inodes themselves can be emitted bottom-up afterwards
        // with every referenced record already placed
        for &idx in &order {
            if matches!(self.nodes[idx].kind, NodeKind::Directory { .. }) {
                continue;
            }
            let mut inode = self.make_inode(idx, self.nlink(idx));
            inode.simplify();
            let reference = inode_writer.current_reference();
            inode.write(&mut inode_writer)?;
            refs[idx] = Some(reference);
            export_refs[self.nodes[idx].inode_number as usize - 1] = reference.inode_ref();
        }

        for &idx in order.iter().rev() {
            let NodeKind::Directory { children } = &self.nodes[idx].kind else {
                continue;
            };

            let mut builder = DirectoryBuilder::new();
            for (name, &child_idx) in children {
                let (real_idx, entry_tag) = match &self.nodes[child_idx].kind {
                    NodeKind::Hardlink { target } => {
                        (*target, self.entry_tag(*target))
                    }
                    _ => (child_idx, self.entry_tag(child_idx)),
                };
                let reference = refs[real_idx].unwrap();
                builder.add(name, reference, self.nodes[real_idx].inode_number, entry_tag);
            }

            let listing = dir_writer.current_reference();
            builder.write(&mut dir_writer)?;

            let node = &self.nodes[idx];
            let parent_inode = if idx == 0 {
                // the root's parent is by convention one past the last inode
                inode_count + 1
            } else {
                let parent_path = self.parent_path_of(idx);
                self.nodes[self.by_path[&parent_path]].inode_number
            };
            let mut inode = Inode::Directory(DirectoryInode {
                base: InodeBase {
                    permissions: node.meta.permissions,
                    uid_idx: node.meta.uid_idx,
                    gid_idx: node.meta.gid_idx,
                    modified_time: node.meta.mtime,
                    inode_number: node.inode_number,
                },
                extended: true,
                start_block: listing.location,
                offset: listing.offset,
                file_size: builder.stored_file_size(),
                nlink: self.nlink(idx),
                parent_inode,
                xattr_idx: XATTR_ABSENT,
            });
            inode.simplify();
            let reference = inode_writer.current_reference();
            inode.write(&mut inode_writer)?;
            refs[idx] = Some(reference);
            export_refs[self.nodes[idx].inode_number as usize - 1] = reference.inode_ref();
        }

        let root_ref = refs[0].unwrap().inode_ref();
        let mut inode_bytes = Vec::new();
        inode_writer.save(&mut inode_bytes)?;
        let mut directory_bytes = Vec::new();
        dir_writer.save(&mut directory_bytes)?;

        Ok(TreeOutput {
            inode_bytes,
            directory_bytes,
            root_ref,
            inode_count,
            export_refs,
        })
    }

    fn entry_tag(&self, idx: usize) -> u16 {
        match &self.nodes[idx].kind {
            NodeKind::Directory { .. } => crate::format::INODE_TYPE_DIRECTORY,
            NodeKind::File { .. } => crate::format::INODE_TYPE_FILE,
            NodeKind::Symlink { .. } => crate::format::INODE_TYPE_SYMLINK,
            NodeKind::BlockDevice { .. } => crate::format::INODE_TYPE_BLOCK_DEVICE,
            NodeKind::CharDevice { .. } => crate::format::INODE_TYPE_CHAR_DEVICE,
            NodeKind::Fifo => crate::format::INODE_TYPE_FIFO,
            NodeKind::Socket => crate::format::INODE_TYPE_SOCKET,
            NodeKind::Hardlink { target } => self.entry_tag(*target),
        }
    }

    fn parent_path_of(&self, idx: usize) -> String {
        // only used for directories, which are few; a linear scan over the
        // path map keeps the nodes free of parent back-pointers
        let (path, _) = self
            .by_path
            .iter()
            .find(|(_, &i)| i == idx)
            .unwrap();
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(split) => path[..split].to_string(),
        }
    }
}
