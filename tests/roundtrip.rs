use std::io::Cursor;

use anyhow::Result;
use similar_asserts::assert_eq;

use squashfs::{
    format::{FragmentEntry, TABLE_ABSENT},
    inode::Inode,
    CachePolicy, CompressionId, Compressor, EntryMeta, SquashError, SquashReader, SquashWriter,
};

fn meta(permissions: u16, uid: u32, gid: u32, mtime: u32) -> EntryMeta {
    EntryMeta {
        permissions,
        uid,
        gid,
        mtime,
    }
}

/// Deterministic incompressible-ish content.
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15) | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 56) as u8
        })
        .collect()
}

fn read_to_vec<R: squashfs::ReadAt>(reader: &SquashReader<R>, inode: &Inode) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_file(inode, &mut out)?;
    Ok(out)
}

#[test]
fn test_basic_tree_roundtrip() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::zstd())?;
    writer.add_directory("/a", &meta(0o755, 0, 0, 1000))?;
    writer.add_file(
        "/a/b.txt",
        &meta(0o644, 1000, 1000, 2000),
        &b"hello42\n"[..],
        Some(8),
    )?;
    writer.add_symlink("/c", &meta(0o777, 0, 0, 1500), "/a/b.txt")?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(reader.superblock().inode_count.get(), 4);
    assert_eq!(reader.superblock().modification_time.get(), 2000);

    let root = reader.root_inode()?;
    assert_eq!(root.inode_number(), 1);
    let names: Vec<Vec<u8>> = reader
        .children(&root)?
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec![b"a".to_vec(), b"c".to_vec()]);

    let dir = reader.resolve("/a")?;
    assert!(dir.is_directory());
    assert_eq!(dir.base().permissions, 0o755);

    let file = reader.resolve("/a/b.txt")?;
    assert_eq!(file.base().permissions, 0o644);
    assert_eq!(reader.uid_of(&file)?, 1000);
    assert_eq!(reader.gid_of(&file)?, 1000);
    assert_eq!(read_to_vec(&reader, &file)?, b"hello42\n");

    let Inode::Symlink(link) = reader.resolve("/c")? else {
        panic!("expected a symlink");
    };
    assert_eq!(link.target, b"/a/b.txt");

    assert!(matches!(
        reader.resolve("/a/missing"),
        Err(SquashError::NotFound(_))
    ));
    assert!(matches!(
        reader.resolve("/a/b.txt/deeper"),
        Err(SquashError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn test_every_compressor() -> Result<()> {
    for compressor in [Compressor::None, Compressor::Zlib, Compressor::zstd()] {
        let content = vec![42u8; 100_000];
        let mut writer = SquashWriter::with_block_size(
            Cursor::new(Vec::new()),
            compressor.clone(),
            4096,
        )?;
        writer.add_file("/big", &meta(0o644, 0, 0, 0), content.as_slice(), None)?;
        writer.finish()?;
        let image = writer.into_inner().into_inner();

        let reader = SquashReader::open(image)?;
        assert_eq!(
            reader.superblock().compression_id.get(),
            compressor.id() as u16
        );
        let file = reader.resolve("/big")?;
        assert_eq!(read_to_vec(&reader, &file)?, content);
    }
    Ok(())
}

#[test]
fn test_passthrough_codec_writes_raw() -> Result<()> {
    // lzo is recognized but has no transform; everything is stored raw
    let codec = Compressor::Passthrough(CompressionId::Lzo);
    let mut writer = SquashWriter::with_block_size(Cursor::new(Vec::new()), codec, 4096)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), &vec![1u8; 9000][..], None)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(
        reader.superblock().compression_id.get(),
        CompressionId::Lzo as u16
    );
    let file = reader.resolve("/f")?;
    assert_eq!(read_to_vec(&reader, &file)?, vec![1u8; 9000]);
    Ok(())
}

#[test]
fn test_sparse_blocks_take_no_space() -> Result<()> {
    let mut content = vec![0u8; 4096];
    content.extend_from_slice(b"tail");
    let mut writer =
        SquashWriter::with_block_size(Cursor::new(Vec::new()), Compressor::Zlib, 4096)?;
    writer.add_file("/sparse", &meta(0o644, 0, 0, 0), content.as_slice(), None)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    let inode = reader.resolve("/sparse")?;
    let Inode::File(file) = &inode else {
        panic!("expected a file");
    };
    assert_eq!(file.block_sizes.len(), 1);
    assert!(file.block_sizes[0].is_sparse());
    assert_eq!(file.sparse, 4096);
    assert_eq!(read_to_vec(&reader, &inode)?, content);
    Ok(())
}

#[test]
fn test_fragment_packing() -> Result<()> {
    let mut writer =
        SquashWriter::with_block_size(Cursor::new(Vec::new()), Compressor::None, 4096)?;
    // three 1000-byte tails fit in one 4096-byte fragment block
    for i in 0..3u64 {
        let path = format!("/f{i}");
        writer.add_file(&path, &meta(0o644, 0, 0, 0), noise(1000, i).as_slice(), None)?;
    }
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(reader.superblock().fragment_count.get(), 1);
    assert_eq!(reader.fragment_table().len(), 1);

    for i in 0..3u64 {
        let inode = reader.resolve(&format!("/f{i}"))?;
        let Inode::File(file) = &inode else {
            panic!("expected a file");
        };
        assert_eq!(file.fragment, Some((0, i as u32 * 1000)));
        assert_eq!(read_to_vec(&reader, &inode)?, noise(1000, i));
    }
    Ok(())
}

#[test]
fn test_fragment_block_count_scales_with_tail_bytes() -> Result<()> {
    let mut writer =
        SquashWriter::with_block_size(Cursor::new(Vec::new()), Compressor::None, 4096)?;
    // five 1000-byte tails: 5000 bytes of fragments need two 4096-byte blocks
    for i in 0..5u64 {
        let path = format!("/f{i}");
        writer.add_file(&path, &meta(0o644, 0, 0, 0), noise(1000, i).as_slice(), None)?;
    }
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(reader.superblock().fragment_count.get(), 2);
    for i in 0..5u64 {
        let inode = reader.resolve(&format!("/f{i}"))?;
        assert_eq!(read_to_vec(&reader, &inode)?, noise(1000, i));
    }
    Ok(())
}

#[test]
fn test_empty_image() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::Zlib)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(reader.superblock().inode_count.get(), 1);
    let root = reader.root_inode()?;
    assert!(reader.children(&root)?.is_empty());
    assert!(reader.lookup(&root, b"anything")?.is_none());
    Ok(())
}

#[test]
fn test_multi_block_file_without_fragment() -> Result<()> {
    let content = noise(3 * 4096, 7);
    let mut writer =
        SquashWriter::with_block_size(Cursor::new(Vec::new()), Compressor::None, 4096)?;
    writer.add_file("/exact", &meta(0o644, 0, 0, 0), content.as_slice(), None)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    let inode = reader.resolve("/exact")?;
    let Inode::File(file) = &inode else {
        panic!("expected a file");
    };
    assert_eq!(file.block_sizes.len(), 3);
    assert_eq!(file.fragment, None);
    assert_eq!(read_to_vec(&reader, &inode)?, content);
    Ok(())
}

#[test]
fn test_export_table_maps_every_inode() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    writer.add_directory("/d", &meta(0o755, 0, 0, 0))?;
    writer.add_file("/d/f", &meta(0o644, 0, 0, 0), &b"x"[..], None)?;
    writer.add_fifo("/p", &meta(0o600, 0, 0, 0))?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    let export = reader.export_table().expect("export table present");
    for number in 1..=reader.superblock().inode_count.get() {
        let inode = reader.inode_at(export.inode_ref(number)?)?;
        assert_eq!(inode.inode_number(), number);
    }
    Ok(())
}

#[test]
fn test_absent_export_table() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), &b"data"[..], None)?;
    writer.finish()?;
    let mut image = writer.into_inner().into_inner();

    // clear the export table offset, as images without NFS export support
    // carry it
    image[88..96].copy_from_slice(&TABLE_ABSENT.to_le_bytes());

    let reader = SquashReader::open(image)?;
    assert!(reader.export_table().is_none());
    let file = reader.resolve("/f")?;
    assert_eq!(read_to_vec(&reader, &file)?, b"data");
    Ok(())
}

#[test]
fn test_id_table_dedup() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    for i in 0..10 {
        writer.add_directory(&format!("/d{i}"), &meta(0o755, 1000, 2000, 0))?;
    }
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    // root id 0 plus the two distinct ids
    assert_eq!(reader.superblock().id_count.get(), 3);
    assert_eq!(reader.id_table().ids(), &[0, 1000, 2000]);
    let dir = reader.resolve("/d3")?;
    assert_eq!(reader.uid_of(&dir)?, 1000);
    assert_eq!(reader.gid_of(&dir)?, 2000);
    Ok(())
}

#[test]
fn test_hardlinks_share_an_inode() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), &b"shared"[..], None)?;
    writer.add_hardlink("/hard", "/f")?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    // one directory, one file inode
    assert_eq!(reader.superblock().inode_count.get(), 2);

    let original = reader.resolve("/f")?;
    let link = reader.resolve("/hard")?;
    assert_eq!(original.inode_number(), link.inode_number());

    let Inode::File(file) = &link else {
        panic!("expected a file");
    };
    assert_eq!(file.nlink, 2);
    assert_eq!(read_to_vec(&reader, &link)?, b"shared");
    Ok(())
}

#[test]
fn test_device_and_ipc_inodes() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    writer.add_block_device("/sda", &meta(0o660, 0, 0, 0), 8, 0)?;
    writer.add_char_device("/null", &meta(0o666, 0, 0, 0), 1, 3)?;
    writer.add_fifo("/pipe", &meta(0o600, 0, 0, 0))?;
    writer.add_socket("/sock", &meta(0o600, 0, 0, 0))?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    let Inode::BlockDevice(dev) = reader.resolve("/sda")? else {
        panic!("expected a block device");
    };
    assert_eq!(squashfs::format::device_major(dev.device), 8);
    assert_eq!(squashfs::format::device_minor(dev.device), 0);

    let Inode::CharDevice(dev) = reader.resolve("/null")? else {
        panic!("expected a char device");
    };
    assert_eq!(squashfs::format::device_major(dev.device), 1);
    assert_eq!(squashfs::format::device_minor(dev.device), 3);

    assert!(matches!(reader.resolve("/pipe")?, Inode::Fifo(_)));
    assert!(matches!(reader.resolve("/sock")?, Inode::Socket(_)));
    Ok(())
}

#[test]
fn test_large_directory_listing() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::Zlib)?;
    writer.add_directory("/big", &meta(0o755, 0, 0, 0))?;
    for i in 0..300 {
        writer.add_file(
            &format!("/big/file{i:04}"),
            &meta(0o644, 0, 0, 0),
            &b"x"[..],
            None,
        )?;
    }
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    let dir = reader.resolve("/big")?;
    let entries = reader.children(&dir)?;
    assert_eq!(entries.len(), 300);
    for window in entries.windows(2) {
        assert!(window[0].name < window[1].name);
    }
    assert_eq!(entries[123].name, b"file0123");

    let file = reader.resolve("/big/file0256")?;
    assert_eq!(read_to_vec(&reader, &file)?, b"x");
    Ok(())
}

#[test]
fn test_writer_argument_errors() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    writer.add_directory("/a", &meta(0o755, 0, 0, 0))?;

    assert!(matches!(
        writer.add_directory("/a", &meta(0o755, 0, 0, 0)),
        Err(SquashError::DuplicateEntry(_))
    ));
    assert!(matches!(
        writer.add_file("/no/such/parent", &meta(0o644, 0, 0, 0), &b""[..], None),
        Err(SquashError::MissingParent(_))
    ));
    assert!(matches!(
        writer.add_symlink("relative", &meta(0o777, 0, 0, 0), "x"),
        Err(SquashError::InvalidPath(_))
    ));
    assert!(matches!(
        writer.add_hardlink("/link", "/a"),
        Err(SquashError::HardlinkToDirectory(_))
    ));

    // the failed adds do not poison the writer
    writer.add_file("/a/ok", &meta(0o644, 0, 0, 0), &b"fine"[..], None)?;
    writer.finish()?;
    Ok(())
}

#[test]
fn test_rejected_entries_commit_no_bytes() -> Result<()> {
    let mut writer =
        SquashWriter::with_block_size(Cursor::new(Vec::new()), Compressor::None, 4096)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), noise(100, 1).as_slice(), None)?;

    // every rejected entry uses a marker uid that must never reach the
    // id table
    let bad = meta(0o644, 4242, 4242, 0);
    assert!(matches!(
        writer.add_file("/f", &bad, noise(100, 2).as_slice(), None),
        Err(SquashError::DuplicateEntry(_))
    ));
    assert!(matches!(
        writer.add_file("/nope/f", &bad, noise(100, 3).as_slice(), None),
        Err(SquashError::MissingParent(_))
    ));
    assert!(matches!(
        writer.add_file("/long", &bad, noise(200, 4).as_slice(), Some(100)),
        Err(SquashError::SizeMismatch {
            declared: 100,
            actual: 200
        })
    ));
    assert!(matches!(
        writer.add_file("/short", &bad, noise(50, 5).as_slice(), Some(100)),
        Err(SquashError::SizeMismatch {
            declared: 100,
            actual: 50
        })
    ));
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    // only /f's tail made it into the single fragment block
    assert_eq!(reader.superblock().fragment_count.get(), 1);
    assert_eq!(reader.fragment_table().entry(0)?.stored_size(), 100);
    assert!(!reader.id_table().ids().contains(&4242));
    let file = reader.resolve("/f")?;
    assert_eq!(read_to_vec(&reader, &file)?, noise(100, 1));
    Ok(())
}

#[test]
fn test_permission_bits_validated() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    assert!(matches!(
        writer.add_directory("/d", &meta(0xf000, 0, 0, 0)),
        Err(SquashError::InvalidPermissions(0xf000))
    ));
    assert!(matches!(
        writer.add_file("/s", &meta(0o10644, 0, 0, 0), &b"x"[..], None),
        Err(SquashError::InvalidPermissions(_))
    ));

    // setuid/setgid/sticky bits are within the mode's 12 bits
    writer.add_directory("/d", &meta(0o7777, 0, 0, 0))?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(reader.resolve("/d")?.base().permissions, 0o7777);
    Ok(())
}

#[test]
fn test_image_at_nonzero_base() -> Result<()> {
    let mut cursor = Cursor::new(vec![0xeeu8; 1000]);
    cursor.set_position(1000);
    let mut writer = SquashWriter::new(cursor, Compressor::None)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), &b"embedded"[..], None)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    // the leading bytes are untouched
    assert_eq!(&image[..1000], &[0xeeu8; 1000][..]);

    let reader = SquashReader::open_with(image, 1000, CachePolicy::default())?;
    let file = reader.resolve("/f")?;
    assert_eq!(read_to_vec(&reader, &file)?, b"embedded");
    Ok(())
}

#[test]
fn test_cache_policy_none() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::Zlib)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), noise(10_000, 3).as_slice(), None)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open_with(image, 0, CachePolicy::None)?;
    let file = reader.resolve("/f")?;
    assert_eq!(read_to_vec(&reader, &file)?, noise(10_000, 3));
    // a second pass re-decodes everything
    assert_eq!(read_to_vec(&reader, &file)?, noise(10_000, 3));
    Ok(())
}

#[test]
fn test_read_range() -> Result<()> {
    // zeros block, patterned block, 1000-byte tail
    let mut content = vec![0u8; 4096];
    content.extend_from_slice(&[0xab; 4096]);
    content.extend_from_slice(&[0xcd; 1000]);
    let mut writer =
        SquashWriter::with_block_size(Cursor::new(Vec::new()), Compressor::Zlib, 4096)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 0), content.as_slice(), None)?;
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    let file = reader.resolve("/f")?;

    // spans the sparse/data block boundary
    let mut buf = vec![0xffu8; 200];
    assert_eq!(reader.read_range(&file, 4000, &mut buf)?, 200);
    assert_eq!(&buf[..], &content[4000..4200]);

    // spans the data block/fragment boundary and hits end of file
    let mut buf = vec![0u8; 1400];
    assert_eq!(reader.read_range(&file, 8000, &mut buf)?, 1192);
    assert_eq!(&buf[..1192], &content[8000..]);

    // entirely inside the fragment
    let mut buf = vec![0u8; 10];
    assert_eq!(reader.read_range(&file, 8500, &mut buf)?, 10);
    assert_eq!(&buf[..], &content[8500..8510]);

    // past the end
    assert_eq!(reader.read_range(&file, 20_000, &mut buf)?, 0);
    Ok(())
}

#[test]
fn test_file_backed_storage() -> Result<()> {
    let file = tempfile::tempfile()?;
    let mut writer = SquashWriter::new(&file, Compressor::zstd())?;
    writer.add_directory("/d", &meta(0o755, 0, 0, 0))?;
    writer.add_file("/d/f", &meta(0o644, 0, 0, 0), noise(50_000, 9).as_slice(), None)?;
    writer.finish()?;
    drop(writer);

    let reader = SquashReader::open(&file)?;
    let inode = reader.resolve("/d/f")?;
    assert_eq!(read_to_vec(&reader, &inode)?, noise(50_000, 9));
    Ok(())
}

#[test]
fn test_modification_time_override() -> Result<()> {
    let mut writer = SquashWriter::new(Cursor::new(Vec::new()), Compressor::None)?;
    writer.add_file("/f", &meta(0o644, 0, 0, 9999), &b"x"[..], None)?;
    writer.set_modification_time(1234);
    writer.finish()?;
    let image = writer.into_inner().into_inner();

    let reader = SquashReader::open(image)?;
    assert_eq!(reader.superblock().modification_time.get(), 1234);
    Ok(())
}

#[test]
fn test_corrupt_superblock_rejected() {
    assert!(matches!(
        SquashReader::open(vec![0u8; 96]),
        Err(SquashError::BadMagic(0))
    ));
    assert!(matches!(
        SquashReader::open(vec![0u8; 10]),
        Err(SquashError::Io(_))
    ));
}

#[test]
fn test_fragment_entry_layout_is_stable() {
    // 16 bytes on disk, uncompressed bit at 1 << 24
    let entry = FragmentEntry::new(96, 100, false);
    assert_eq!(entry.stored_size(), 100);
    assert_eq!(entry.size.get(), 100 | (1 << 24));
}
