use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ReservedRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReservedRegion {
    /// Maps `len` bytes of lazily backed anonymous memory.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn reserve(len: usize) -> io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, RESERVE_FLAGS, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Pages are backed on first touch, so there is nothing to do.
    ///
    /// # Safety
    ///
    /// The range must lie inside the reservation.
    pub unsafe fn commit(&self, _offset: usize, _len: usize) -> io::Result<()> {
        Ok(())
    }

    /// Replaces the range with a fresh zero-filled mapping, dropping the
    /// physical pages behind it.
    ///
    /// # Safety
    ///
    /// The range must lie inside the reservation and nothing may hold
    /// references into it.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr().add(offset) }.cast::<libc::c_void>();
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr = unsafe { libc::mmap(addr, len, prot, RESERVE_FLAGS | libc::MAP_FIXED, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
