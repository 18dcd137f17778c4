//! Pluggable block compression.
//!
//! SquashFS names its codec in the superblock; every block in the image is
//! then compressed with that one codec, or stored raw when compression would
//! not shrink it.  Only none/zlib/zstd transform data here.  The remaining
//! ids from the on-disk enumeration are accepted so that a writer can emit
//! (all-raw) images under them and a reader can open them, but a block that
//! is actually flagged compressed under one of them is reported unsupported
//! rather than misdecoded.

use std::io::{Read, Write};

use flate2::write::ZlibEncoder;

use crate::{Result, SquashError};

/// On-disk compression id enumeration from the superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressionId {
    None = 0,
    Zlib = 1,
    Lzma = 2,
    Lzo = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl CompressionId {
    pub fn from_raw(id: u16) -> Result<Self> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            2 => Ok(Self::Lzma),
            3 => Ok(Self::Lzo),
            4 => Ok(Self::Xz),
            5 => Ok(Self::Lz4),
            6 => Ok(Self::Zstd),
            other => Err(SquashError::UnknownCompression(other)),
        }
    }
}

const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// A concrete codec instance.
#[derive(Clone, Debug)]
pub enum Compressor {
    None,
    Zlib,
    Zstd { level: i32 },
    /// A recognized id with no transform implemented.  Writing under it
    /// always stores raw; reading a block flagged compressed fails.
    Passthrough(CompressionId),
}

impl Compressor {
    pub fn zstd() -> Self {
        Compressor::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }

    /// The codec a reader should use for an image declaring `id`.
    pub fn from_id(id: CompressionId) -> Self {
        match id {
            CompressionId::None => Compressor::None,
            CompressionId::Zlib => Compressor::Zlib,
            CompressionId::Zstd => Compressor::zstd(),
            other => Compressor::Passthrough(other),
        }
    }

    pub fn id(&self) -> CompressionId {
        match self {
            Compressor::None => CompressionId::None,
            Compressor::Zlib => CompressionId::Zlib,
            Compressor::Zstd { .. } => CompressionId::Zstd,
            Compressor::Passthrough(id) => *id,
        }
    }

    /// Compresses `data`, returning `None` when the result would not be
    /// strictly smaller than the input (the anti-expansion rule shared by
    /// metadata blocks, data blocks and fragment blocks).
    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let compressed = match self {
            Compressor::None | Compressor::Passthrough(..) => return Ok(None),
            Compressor::Zlib => {
                let mut encoder =
                    ZlibEncoder::new(Vec::new(), flate2::Compression::best());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compressor::Zstd { level } => zstd::bulk::compress(data, *level)?,
        };
        if compressed.len() >= data.len() {
            Ok(None)
        } else {
            Ok(Some(compressed))
        }
    }

    /// Decompresses a block that was flagged compressed on disk.  The result
    /// must not exceed `max_size` (the uncompressed block capacity); a larger
    /// result means the image is corrupt.
    pub fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compressor::None => {
                return Err(SquashError::Corrupt(
                    "block flagged compressed in an uncompressed image",
                ))
            }
            Compressor::Passthrough(id) => {
                return Err(SquashError::UnsupportedCompression(*id))
            }
            Compressor::Zlib => {
                let decoder = flate2::read::ZlibDecoder::new(data);
                let mut out = Vec::with_capacity(max_size);
                decoder.take(max_size as u64 + 1).read_to_end(&mut out)?;
                out
            }
            Compressor::Zstd { .. } => zstd::bulk::decompress(data, max_size + 1)?,
        };
        if out.len() > max_size {
            return Err(SquashError::Corrupt("decompressed block exceeds capacity"));
        }
        Ok(out)
    }
}
