//! Reference-counted page buffers.
//!
//! A [`StatefulBuffer`] owns the physical backing bytes for exactly one
//! [`VirtualPageId`]; the cache guarantees at most one live instance per id.
//! Pages bind to a buffer and borrow byte windows from it through
//! [`BufferStream`]; they never own the bytes themselves. Lifetime is
//! reference counted: created on first access, pinned while any holder has
//! a reference, retired by the scavenger once `can_free` holds.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page_id::VirtualPageId;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Reference-counted holder of one page's backing bytes.
#[derive(Debug)]
pub struct StatefulBuffer {
    page_id: VirtualPageId,
    data: RwLock<Box<[u8]>>,
    ref_count: AtomicU32,
    dirty: AtomicBool,
    /// Set while a flush has the contents pinned; writable streams are
    /// refused until the flush completes.
    read_locked: AtomicBool,
    retired: AtomicBool,
}

impl StatefulBuffer {
    pub(crate) fn new(page_id: VirtualPageId, data: Box<[u8]>) -> Self {
        Self {
            page_id,
            data: RwLock::new(data),
            ref_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            read_locked: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> VirtualPageId {
        self.page_id
    }

    /// Size of the backing storage in bytes. Fixed for the buffer's life.
    pub fn buffer_size(&self) -> usize {
        self.data.read().len()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Eviction eligibility: no references, clean, not already retired.
    pub fn can_free(&self) -> bool {
        !self.is_retired() && self.ref_count() == 0 && !self.is_dirty()
    }

    /// Takes a reference on this buffer.
    pub fn add_ref(&self) -> StorageResult<()> {
        self.check_retired()?;
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drops a reference. Fails with [`StorageError::Underflow`] if the
    /// count would go negative; the count is left at zero in that case.
    pub fn release(&self) -> StorageResult<()> {
        self.check_retired()?;
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| StorageError::Underflow {
                page_id: self.page_id,
            })?;
        Ok(())
    }

    /// Marks the buffer dirty. Idempotent.
    pub fn set_dirty(&self) -> StorageResult<()> {
        self.check_retired()?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Clears the dirty flag after a confirmed flush.
    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Retires the buffer, releasing it for reuse. Only valid while
    /// `can_free` holds; the caller (the cache) is responsible for making
    /// the eligibility check atomic with respect to concurrent `add_ref`.
    pub(crate) fn try_retire(&self) -> StorageResult<()> {
        let ref_count = self.ref_count();
        let dirty = self.is_dirty();
        if ref_count != 0 || dirty {
            return Err(StorageError::BufferInUse {
                page_id: self.page_id,
                ref_count,
                dirty,
            });
        }
        self.retired.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Pins the contents read-only for the duration of a flush.
    pub(crate) fn lock_read_only(&self) {
        self.read_locked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unlock_read_only(&self) {
        self.read_locked.store(false, Ordering::SeqCst);
    }

    /// Copies the current contents, holding the read lock only for the
    /// duration of the copy.
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }

    /// Returns a bounded stream over `[offset, offset + count)`.
    ///
    /// Fails with [`StorageError::OutOfRange`] when the window exceeds the
    /// buffer and with [`StorageError::ReadOnlyViolation`] when `writable`
    /// is requested while the contents are pinned read-only.
    pub fn stream(
        &self,
        offset: usize,
        count: usize,
        writable: bool,
    ) -> StorageResult<BufferStream<'_>> {
        self.check_retired()?;

        let buffer_size = self.buffer_size();
        if offset.checked_add(count).map_or(true, |end| end > buffer_size) {
            return Err(StorageError::OutOfRange {
                offset,
                count,
                buffer_size,
            });
        }

        let guard = if writable {
            if self.read_locked.load(Ordering::SeqCst) {
                return Err(StorageError::ReadOnlyViolation { target: "buffer" });
            }
            StreamGuard::Write(self.data.write())
        } else {
            StreamGuard::Read(self.data.read())
        };

        Ok(BufferStream {
            guard,
            start: offset,
            len: count,
            pos: 0,
        })
    }

    fn check_retired(&self) -> StorageResult<()> {
        if self.is_retired() {
            return Err(StorageError::AlreadyDisposed { target: "buffer" });
        }
        Ok(())
    }
}

#[derive(Debug)]
enum StreamGuard<'a> {
    Read(RwLockReadGuard<'a, Box<[u8]>>),
    Write(RwLockWriteGuard<'a, Box<[u8]>>),
}

/// Bounded read/write view over a buffer's bytes.
///
/// Holds the buffer's data lock for its lifetime, so keep streams short
/// lived. Writing through a read-only stream fails with
/// `io::ErrorKind::PermissionDenied`.
#[derive(Debug)]
pub struct BufferStream<'a> {
    guard: StreamGuard<'a>,
    start: usize,
    len: usize,
    pos: usize,
}

impl BufferStream<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn window(&self) -> &[u8] {
        let data: &[u8] = match &self.guard {
            StreamGuard::Read(guard) => guard,
            StreamGuard::Write(guard) => guard,
        };
        &data[self.start..self.start + self.len]
    }
}

impl Read for BufferStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let window = self.window();
        let remaining = &window[self.pos.min(window.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for BufferStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (start, len, pos) = (self.start, self.len, self.pos);
        let data = match &mut self.guard {
            StreamGuard::Write(guard) => guard,
            StreamGuard::Read(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "stream is read-only",
                ))
            }
        };
        let window = &mut data[start..start + len];
        let remaining = &mut window[pos.min(len)..];
        if remaining.is_empty() && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past end of buffer window",
            ));
        }
        let n = remaining.len().min(buf.len());
        remaining[..n].copy_from_slice(&buf[..n]);
        self.pos += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BufferStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.len as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if !(0..=self.len as i64).contains(&target) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside buffer window",
            ));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }
}
