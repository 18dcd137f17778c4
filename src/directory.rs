//! Directory listings.
//!
//! A listing is a run of headers, each followed by up to 256 entries.  All
//! entries under one header share the metadata block location of their inode
//! records and encode their inode numbers as signed 16-bit deltas from the
//! header's base, so a header break is forced whenever the location changes,
//! the entry limit is hit or a delta stops fitting.  Entries are written in
//! strictly ascending name order, which is what allows lookups to stop early.

use crate::{
    format::{
        DirectoryEntryRecord, DirectoryHeaderRecord, InodeRef, DIRECTORY_MAX_ENTRIES,
        DIRECTORY_SIZE_BIAS,
    },
    io::ReadAt,
    metadata::{MetadataReader, MetadataRef, MetadataWriter},
    Result, SquashError,
};

struct PendingEntry {
    offset: u16,
    inode_delta: i16,
    entry_type: u16,
    name: Vec<u8>,
}

struct PendingHeader {
    start_block: u32,
    inode_number: u32,
    entries: Vec<PendingEntry>,
}

/// Accumulates one directory's entries, already in name order, and encodes
/// them as headers plus entries.
#[derive(Default)]
pub struct DirectoryBuilder {
    headers: Vec<PendingHeader>,
}

impl DirectoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Appends an entry.  The caller feeds entries in ascending name order.
    pub fn add(&mut self, name: &[u8], inode_ref: MetadataRef, inode_number: u32, entry_type: u16) {
        let delta = self.headers.last().and_then(|h| {
            if h.start_block != inode_ref.location || h.entries.len() == DIRECTORY_MAX_ENTRIES {
                return None;
            }
            i16::try_from(inode_number as i64 - h.inode_number as i64).ok()
        });

        let (header, delta) = match delta {
            Some(delta) => (self.headers.last_mut().unwrap(), delta),
            None => {
                self.headers.push(PendingHeader {
                    start_block: inode_ref.location,
                    inode_number,
                    entries: Vec::new(),
                });
                (self.headers.last_mut().unwrap(), 0)
            }
        };
        header.entries.push(PendingEntry {
            offset: inode_ref.offset,
            inode_delta: delta,
            entry_type,
            name: name.to_vec(),
        });
    }

    /// Encoded listing length in bytes, without the fixed size bias.
    pub fn byte_size(&self) -> u32 {
        self.headers
            .iter()
            .map(|h| {
                12 + h
                    .entries
                    .iter()
                    .map(|e| 8 + e.name.len() as u32)
                    .sum::<u32>()
            })
            .sum()
    }

    /// The value to store in the owning directory inode's `file_size`.
    pub fn stored_file_size(&self) -> u32 {
        self.byte_size() + DIRECTORY_SIZE_BIAS
    }

    pub fn write(&self, w: &mut MetadataWriter) -> Result<()> {
        for header in &self.headers {
            w.write_struct(DirectoryHeaderRecord {
                count: (header.entries.len() as u32 - 1).into(),
                start_block: header.start_block.into(),
                inode_number: header.inode_number.into(),
            })?;
            for entry in &header.entries {
                w.write_struct(DirectoryEntryRecord {
                    offset: entry.offset.into(),
                    inode_delta: entry.inode_delta.into(),
                    entry_type: entry.entry_type.into(),
                    name_size: (entry.name.len() as u16 - 1).into(),
                })?;
                w.write(&entry.name)?;
            }
        }
        Ok(())
    }
}

/// One decoded directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: Vec<u8>,
    pub start_block: u32,
    pub offset: u16,
    pub inode_number: u32,
    /// Basic inode type tag of the target.
    pub type_tag: u16,
}

impl DirectoryEntry {
    pub fn inode_ref(&self) -> InodeRef {
        InodeRef::new(self.start_block, self.offset)
    }
}

fn read_header<R: ReadAt + ?Sized>(
    reader: &mut MetadataReader<'_, R>,
) -> Result<(DirectoryHeaderRecord, usize)> {
    let header: DirectoryHeaderRecord = reader.read_struct()?;
    let count = header.count.get() as usize + 1;
    if count > DIRECTORY_MAX_ENTRIES {
        return Err(SquashError::Corrupt("directory header entry count over 256"));
    }
    Ok((header, count))
}

fn read_entry<R: ReadAt + ?Sized>(
    reader: &mut MetadataReader<'_, R>,
    header: &DirectoryHeaderRecord,
) -> Result<DirectoryEntry> {
    let record: DirectoryEntryRecord = reader.read_struct()?;
    let name = reader.read_vec(record.name_size.get() as usize + 1)?;
    let inode_number = header.inode_number.get() as i64 + record.inode_delta.get() as i64;
    Ok(DirectoryEntry {
        name,
        start_block: header.start_block.get(),
        offset: record.offset.get(),
        inode_number: inode_number as u32,
        type_tag: record.entry_type.get(),
    })
}

/// Decodes a full listing.  `listing_bytes` is the directory inode's stored
/// file size minus the fixed bias; the listing must consume exactly that
/// many bytes.
pub fn read_listing<R: ReadAt + ?Sized>(
    reader: &mut MetadataReader<'_, R>,
    listing_bytes: usize,
) -> Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    while reader.position() < listing_bytes {
        let (header, count) = read_header(reader)?;
        for _ in 0..count {
            entries.push(read_entry(reader, &header)?);
        }
    }
    if reader.position() != listing_bytes {
        return Err(SquashError::DirectoryCountMismatch {
            read: reader.position(),
            expected: listing_bytes,
        });
    }
    Ok(entries)
}

/// Scans a listing for `name`, stopping early once the entries pass it in
/// sort order.
pub fn find_entry<R: ReadAt + ?Sized>(
    reader: &mut MetadataReader<'_, R>,
    listing_bytes: usize,
    name: &[u8],
) -> Result<Option<DirectoryEntry>> {
    while reader.position() < listing_bytes {
        let (header, count) = read_header(reader)?;
        for _ in 0..count {
            let entry = read_entry(reader, &header)?;
            match entry.name.as_slice().cmp(name) {
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => {}
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        compression::Compressor,
        format::INODE_TYPE_FILE,
        metadata::{BlockCache, CachePolicy},
    };

    fn encode(builder: &DirectoryBuilder) -> Vec<u8> {
        let mut writer = MetadataWriter::new(Compressor::None);
        builder.write(&mut writer).unwrap();
        let mut encoded = Vec::new();
        writer.save(&mut encoded).unwrap();
        encoded
    }

    fn decode(encoded: &[u8], listing_bytes: usize) -> Vec<DirectoryEntry> {
        let compressor = Compressor::None;
        let cache = BlockCache::new(CachePolicy::None);
        let mut reader = MetadataReader::new(encoded, &compressor, &cache, 0, 0).unwrap();
        read_listing(&mut reader, listing_bytes).unwrap()
    }

    fn rf(location: u32, offset: u16) -> MetadataRef {
        MetadataRef { location, offset }
    }

    #[test]
    fn test_small_listing_roundtrip() {
        let mut builder = DirectoryBuilder::new();
        builder.add(b"alpha", rf(0, 16), 2, INODE_TYPE_FILE);
        builder.add(b"beta", rf(0, 48), 3, INODE_TYPE_FILE);

        // one header, two entries
        assert_eq!(builder.byte_size(), 12 + (8 + 5) + (8 + 4));
        assert_eq!(builder.stored_file_size(), builder.byte_size() + 3);

        let encoded = encode(&builder);
        let entries = decode(&encoded, builder.byte_size() as usize);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"alpha");
        assert_eq!(entries[0].inode_number, 2);
        assert_eq!(entries[0].inode_ref(), crate::format::InodeRef::new(0, 16));
        assert_eq!(entries[1].name, b"beta");
        assert_eq!(entries[1].inode_number, 3);
    }

    #[test]
    fn test_header_split_on_location_change() {
        let mut builder = DirectoryBuilder::new();
        builder.add(b"a", rf(0, 0), 2, INODE_TYPE_FILE);
        builder.add(b"b", rf(8194, 0), 3, INODE_TYPE_FILE);
        assert_eq!(builder.headers.len(), 2);

        let encoded = encode(&builder);
        let entries = decode(&encoded, builder.byte_size() as usize);
        assert_eq!(entries[0].start_block, 0);
        assert_eq!(entries[1].start_block, 8194);
    }

    #[test]
    fn test_header_split_on_delta_overflow() {
        let mut builder = DirectoryBuilder::new();
        builder.add(b"a", rf(0, 0), 2, INODE_TYPE_FILE);
        builder.add(b"b", rf(0, 32), 2 + i16::MAX as u32 + 1, INODE_TYPE_FILE);
        assert_eq!(builder.headers.len(), 2);

        let encoded = encode(&builder);
        let entries = decode(&encoded, builder.byte_size() as usize);
        assert_eq!(entries[1].inode_number, 2 + i16::MAX as u32 + 1);
    }

    #[test]
    fn test_header_split_on_entry_limit() {
        let mut builder = DirectoryBuilder::new();
        for i in 0..300u32 {
            let name = format!("entry{i:04}");
            builder.add(name.as_bytes(), rf(0, (i * 32) as u16), 2 + i, INODE_TYPE_FILE);
        }
        assert_eq!(builder.headers.len(), 2);
        assert_eq!(builder.headers[0].entries.len(), 256);

        let encoded = encode(&builder);
        let entries = decode(&encoded, builder.byte_size() as usize);
        assert_eq!(entries.len(), 300);
        assert_eq!(entries[299].inode_number, 301);
    }

    #[test]
    fn test_find_entry() {
        let mut builder = DirectoryBuilder::new();
        builder.add(b"bar", rf(0, 0), 2, INODE_TYPE_FILE);
        builder.add(b"foo", rf(0, 32), 3, INODE_TYPE_FILE);
        let encoded = encode(&builder);
        let listing_bytes = builder.byte_size() as usize;

        let compressor = Compressor::None;
        let cache = BlockCache::new(CachePolicy::None);

        let mut reader =
            MetadataReader::new(encoded.as_slice(), &compressor, &cache, 0, 0).unwrap();
        let hit = find_entry(&mut reader, listing_bytes, b"foo").unwrap().unwrap();
        assert_eq!(hit.inode_number, 3);

        // "baz" sorts between the two entries; the scan stops at "foo"
        let mut reader =
            MetadataReader::new(encoded.as_slice(), &compressor, &cache, 0, 0).unwrap();
        assert!(find_entry(&mut reader, listing_bytes, b"baz").unwrap().is_none());
    }

    #[test]
    fn test_listing_length_mismatch() {
        let mut builder = DirectoryBuilder::new();
        builder.add(b"only", rf(0, 0), 2, INODE_TYPE_FILE);
        let encoded = encode(&builder);

        let compressor = Compressor::None;
        let cache = BlockCache::new(CachePolicy::None);
        let mut reader =
            MetadataReader::new(encoded.as_slice(), &compressor, &cache, 0, 0).unwrap();
        let err = read_listing(&mut reader, builder.byte_size() as usize - 1).unwrap_err();
        assert!(matches!(err, SquashError::DirectoryCountMismatch { .. }));
    }
}
