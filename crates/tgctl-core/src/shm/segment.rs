//! File-backed shared-memory segments.
//!
//! A segment is a regular file in the shared-memory directory mapped with
//! `memmap2`. Access goes through two bounds-checked views:
//!
//! - [`SharedSegment::view`] / [`SharedSegment::view_slice`] hand out typed
//!   references to `#[repr(C)]` structs built from atomics, which is how every
//!   cross-process cursor, flag and state word is read and written;
//! - [`SharedSegment::write_bytes`] / [`SharedSegment::read_bytes`] /
//!   [`SharedSegment::bytes`] copy payload bytes in and out of frame arenas.
//!
//! Payload ranges are never touched concurrently: ownership of a frame or
//! chunk passes between processes through the acquire/release cursors that
//! guard it, and only the current owner touches its bytes.

#![allow(unsafe_code)]

use crate::error::{Result, TgError};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// Types that may be overlaid on shared memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain only atomics and plain integers
/// (every bit pattern, including all zeroes, is a valid value), and perform all
/// cross-process mutation through atomics.
pub unsafe trait SharedLayout: Sized + Sync {}

/// A mapped shared-memory segment.
pub struct SharedSegment {
    path: PathBuf,
    _file: File,
    _mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: `base` points into `_mmap`, which lives as long as the segment and is
// never remapped. Shared access from several threads is mediated by atomics
// (typed views) and by the ownership discipline described in the module docs.
unsafe impl Send for SharedSegment {}
// SAFETY: see `Send` above.
unsafe impl Sync for SharedSegment {}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl SharedSegment {
    /// Create a zero-filled segment of `len` bytes, replacing any stale file.
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        if len == 0 {
            return Err(TgError::InvalidSegment {
                path: path.to_path_buf(),
                message: "segment length must be non-zero".to_string(),
            });
        }

        if Self::remove(path)? {
            debug!("Replaced stale segment {}", path.display());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| TgError::io_with_path(e, path))?;
        file.set_len(len as u64)
            .map_err(|e| TgError::io_with_path(e, path))?;

        Self::map(path, file)
    }

    /// Attach to an existing segment.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TgError::io_with_path(e, path))?;

        let len = file
            .metadata()
            .map_err(|e| TgError::io_with_path(e, path))?
            .len();
        if len == 0 {
            return Err(TgError::InvalidSegment {
                path: path.to_path_buf(),
                message: "segment is empty".to_string(),
            });
        }

        Self::map(path, file)
    }

    /// Remove a segment file. Returns `true` if a file was removed.
    pub fn remove(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TgError::io_with_path(e, path)),
        }
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    fn map(path: &Path, file: File) -> Result<Self> {
        // SAFETY: the file is a dedicated segment that other processes modify
        // concurrently by design; the mapping is only accessed through the
        // atomic views and owned byte ranges exposed below.
        let mut mmap =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| TgError::io_with_path(e, path))?;
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| TgError::InvalidSegment {
            path: path.to_path_buf(),
            message: "mapping returned a null base".to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            _mmap: mmap,
            base,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TgError::InvalidSegment {
                path: self.path.clone(),
                message: format!(
                    "range {}..{} exceeds segment length {}",
                    offset,
                    offset.saturating_add(len),
                    self.len
                ),
            }),
        }
    }

    /// Typed view of a shared structure at `offset`.
    pub fn view<T: SharedLayout>(&self, offset: usize) -> Result<&T> {
        self.view_slice::<T>(offset, 1).map(|slice| &slice[0])
    }

    /// Typed view of `count` consecutive shared structures at `offset`.
    pub fn view_slice<T: SharedLayout>(&self, offset: usize, count: usize) -> Result<&[T]> {
        let bytes = size_of::<T>()
            .checked_mul(count)
            .ok_or_else(|| TgError::InvalidSegment {
                path: self.path.clone(),
                message: "view size overflows".to_string(),
            })?;
        self.check_range(offset, bytes)?;
        if offset % align_of::<T>() != 0 {
            return Err(TgError::InvalidSegment {
                path: self.path.clone(),
                message: format!("offset {} is not aligned to {}", offset, align_of::<T>()),
            });
        }

        // SAFETY: the range is in bounds and aligned (the mapping base is page
        // aligned), `T: SharedLayout` is valid for any bit pattern, and the
        // returned lifetime is tied to `&self`, which keeps the mapping alive.
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset) as *const T, count)
        })
    }

    /// Copy `bytes` into the segment at `offset`.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: in bounds; the caller owns this byte range under the cursor
        // protocol, so no other thread or process reads or writes it now.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes at `offset` out of the segment into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        // SAFETY: in bounds; the caller owns this byte range under the cursor
        // protocol.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Borrow a byte range in place. The caller must own the range under the
    /// cursor protocol for as long as the borrow lives.
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        // SAFETY: in bounds; ownership of the range is held by the caller, so
        // the writer side will not touch it until the owner releases it.
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tempfile::TempDir;

    #[repr(C)]
    struct TestHeader {
        magic: AtomicU64,
        counter: AtomicU32,
        _pad: u32,
    }

    // SAFETY: repr(C), atomics and plain integers only.
    unsafe impl SharedLayout for TestHeader {}

    #[test]
    fn test_create_is_zero_filled_and_shared_between_mappings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");

        let a = SharedSegment::create(&path, 4096).unwrap();
        let b = SharedSegment::open(&path).unwrap();

        let ha: &TestHeader = a.view(0).unwrap();
        let hb: &TestHeader = b.view(0).unwrap();
        assert_eq!(hb.magic.load(Ordering::SeqCst), 0);

        ha.magic.store(0xfeed, Ordering::SeqCst);
        ha.counter.fetch_add(3, Ordering::SeqCst);
        assert_eq!(hb.magic.load(Ordering::SeqCst), 0xfeed);
        assert_eq!(hb.counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_bytes_roundtrip_across_mappings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let a = SharedSegment::create(&path, 128).unwrap();
        let b = SharedSegment::open(&path).unwrap();

        a.write_bytes(64, b"payload").unwrap();
        let mut out = [0u8; 7];
        b.read_bytes(64, &mut out).unwrap();
        assert_eq!(&out, b"payload");
        assert_eq!(b.bytes(64, 7).unwrap(), b"payload");
    }

    #[test]
    fn test_out_of_bounds_and_misaligned_views_are_rejected() {
        let dir = TempDir::new().unwrap();
        let seg = SharedSegment::create(dir.path().join("seg"), 32).unwrap();

        assert!(seg.view::<TestHeader>(24).is_err());
        assert!(seg.view::<TestHeader>(4).is_err());
        assert!(seg.write_bytes(30, b"abc").is_err());
        assert!(seg.view_slice::<TestHeader>(0, 2).is_ok());
        assert!(seg.view_slice::<TestHeader>(0, 3).is_err());
    }

    #[test]
    fn test_open_missing_segment_fails() {
        let dir = TempDir::new().unwrap();
        assert!(SharedSegment::open(dir.path().join("absent")).is_err());
        assert!(!SharedSegment::remove(dir.path().join("absent")).unwrap());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 8), 72);
    }
}
