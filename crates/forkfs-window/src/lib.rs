#![forbid(unsafe_code)]
//! Storage window abstraction.
//!
//! A ForkFS image lives in one contiguous, directly addressable byte range
//! (a DAX region, a dma-buf mapping, or an ordinary file). This crate
//! models that range as the [`Window`] trait: offset-addressed reads and
//! writes plus an optional write-back barrier. All persistent structures
//! are placed by offset; nothing above this layer sees pointers.

use forkfs_error::{ForkFsError, Result};
use forkfs_types::ByteOffset;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// A contiguous byte range with a stable offset addressing scheme.
pub trait Window: Send + Sync {
    /// Total length of the window in bytes.
    fn len(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Ensure writes in `[offset, offset + len)` are visible to other
    /// observers. A no-op for backings with write-back semantics.
    fn sync(&self, offset: ByteOffset, len: u64) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(window_len: u64, offset: ByteOffset, len: usize) -> Result<u64> {
    let len = u64::try_from(len).map_err(|_| ForkFsError::Invalid("length overflows u64"))?;
    let end = offset
        .checked_add(len)
        .ok_or(ForkFsError::Invalid("window range overflows u64"))?;
    if end.0 > window_len {
        return Err(ForkFsError::Corruption {
            offset: offset.0,
            detail: format!("access of {len} bytes past window end ({window_len} bytes)"),
        });
    }
    Ok(end.0)
}

/// In-memory window. The canonical backing for tests and for callers that
/// hand ForkFS a mapped region as a byte buffer.
pub struct MemWindow {
    bytes: RwLock<Vec<u8>>,
}

impl MemWindow {
    /// Create a zero-filled window of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0_u8; len]),
        }
    }

    /// Wrap an existing buffer (e.g. a snapshot of a formatted image).
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Clone out the full contents. Test helper.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl Window for MemWindow {
    fn len(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let end = check_range(u64::try_from(bytes.len()).unwrap_or(u64::MAX), offset, buf.len())?;
        let start = offset.to_usize()?;
        let end = forkfs_types::u64_to_usize(end, "window_end")?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let end = check_range(u64::try_from(bytes.len()).unwrap_or(u64::MAX), offset, buf.len())?;
        let start = offset.to_usize()?;
        let end = forkfs_types::u64_to_usize(end, "window_end")?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self, _offset: ByteOffset, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// File-backed window using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileWindow {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileWindow {
    /// Open an existing image file, read-write if permitted, falling back
    /// to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Window for FileWindow {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(self.len, offset, buf.len())?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(ForkFsError::ReadOnly);
        }
        check_range(self.len, offset, buf.len())?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self, _offset: ByteOffset, _len: u64) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Zero a window range in bounded chunks (used when formatting the delta
/// region, which may be large).
pub fn zero_range(window: &dyn Window, offset: ByteOffset, len: u64) -> Result<()> {
    const CHUNK: u64 = 64 * 1024;
    let zeros = vec![0_u8; forkfs_types::u64_to_usize(CHUNK, "zero_chunk")?];
    let mut pos = offset;
    let mut remaining = len;
    while remaining > 0 {
        let step = remaining.min(CHUNK);
        let step_usize = forkfs_types::u64_to_usize(step, "zero_step")?;
        window.write_all_at(pos, &zeros[..step_usize])?;
        pos = pos
            .checked_add(step)
            .ok_or(ForkFsError::Invalid("zero range overflows u64"))?;
        remaining -= step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_window_round_trip() {
        let w = MemWindow::zeroed(4096);
        w.write_all_at(ByteOffset(100), b"hello").expect("write");
        let mut buf = [0_u8; 5];
        w.read_exact_at(ByteOffset(100), &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_window_rejects_out_of_bounds() {
        let w = MemWindow::zeroed(16);
        let mut buf = [0_u8; 8];
        assert!(w.read_exact_at(ByteOffset(12), &mut buf).is_err());
        assert!(w.write_all_at(ByteOffset(9), &buf).is_err());
        assert!(w.write_all_at(ByteOffset(8), &buf).is_ok());
    }

    #[test]
    fn file_window_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("forkfs.img");
        let w = FileWindow::create(&path, 8192).expect("create");
        assert_eq!(w.len(), 8192);
        w.write_all_at(ByteOffset(4096), b"persist").expect("write");
        drop(w);

        let reopened = FileWindow::open(&path).expect("open");
        let mut buf = [0_u8; 7];
        reopened
            .read_exact_at(ByteOffset(4096), &mut buf)
            .expect("read");
        assert_eq!(&buf, b"persist");
    }

    #[test]
    fn zero_range_clears_bytes() {
        let w = MemWindow::from_vec(vec![0xFF_u8; 200_000]);
        zero_range(&w, ByteOffset(10), 150_000).expect("zero");
        let snap = w.snapshot();
        assert_eq!(snap[9], 0xFF);
        assert!(snap[10..150_010].iter().all(|b| *b == 0));
        assert_eq!(snap[150_010], 0xFF);
    }
}
