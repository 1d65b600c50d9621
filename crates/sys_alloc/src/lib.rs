//! Virtual memory reservation primitives.
//!
//! A [`Reservation`] claims a contiguous range of address space up front and
//! lets the owner commit and decommit page ranges inside it as the heap grows
//! and shrinks. The base address never moves for the lifetime of the
//! reservation.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to the next multiple of the page size.
#[must_use]
pub fn round_to_page(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// A reserved range of address space.
///
/// Pages must be committed before they are touched. Memory handed out by a
/// fresh commit, including a commit after [`Reservation::decommit`], reads
/// as zero. The range is released when the handle is dropped.
pub struct Reservation {
    inner: os::ReservedRegion,
}

impl Reservation {
    /// Reserves at least `len` bytes of address space.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error if the
    /// reservation fails.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        let len = round_to_page(len);
        let inner = unsafe { os::ReservedRegion::reserve(len)? };
        Ok(Self { inner })
    }

    /// Returns a pointer to the start of the reservation.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reservation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the reservation is empty. Never true for a live handle.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Makes `[offset, offset + len)` usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is not page aligned or leaves the
    /// reservation, or the OS error if the commit fails.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns `[offset, offset + len)` to the OS. The range reads as zero
    /// once it is committed again.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is not page aligned or leaves the
    /// reservation, or the OS error if the decommit fails.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        unsafe { self.inner.decommit(offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.inner.len());
        if offset % page != 0 || len % page != 0 || !in_bounds {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned and inside the reservation",
            ));
        }
        Ok(())
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}
