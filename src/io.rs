//! Positioned-read storage abstraction.
//!
//! A reader never seeks its storage: every access is an absolute-offset read.
//! This lets one opened image be backed by a plain file, an in-memory buffer
//! or a caller-managed memory mapping, and makes `&[u8]` storage freely
//! shareable between concurrent readers.

use std::io::{Error, ErrorKind, Result};

/// Storage that supports reads at absolute byte offsets.
pub trait ReadAt {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read.  A return of 0 means end of storage.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Fills `buf` completely from `offset`, failing with
    /// [`ErrorKind::UnexpectedEof`] if the storage ends first.
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf) {
                Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.as_slice().read_at(offset, buf)
    }
}

impl ReadAt for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl<R: ReadAt + ?Sized> ReadAt for &R {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_read_at() {
        let data = b"hello world".to_vec();
        let mut buf = [0u8; 5];
        assert_eq!(data.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        // short read at the tail
        assert_eq!(data.read_at(9, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ld");

        // past the end
        assert_eq!(data.read_at(11, &mut buf).unwrap(), 0);
        assert_eq!(data.read_at(u64::MAX, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_exact_at_eof() {
        let data = b"abc".to_vec();
        let mut buf = [0u8; 4];
        let err = data.read_exact_at(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let mut buf = [0u8; 3];
        data.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
