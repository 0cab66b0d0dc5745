use std::{io, ptr::NonNull, sync::OnceLock};

#[cfg(unix)]
mod unix {
    use std::{io, ptr::NonNull};

    use libc::{
        MAP_ANON, MAP_FAILED, MAP_FIXED, MAP_NORESERVE, MAP_PRIVATE,
        PROT_NONE, PROT_READ, PROT_WRITE, c_void,
    };

    /// Maps `len` bytes of inaccessible, unbacked address space.
    pub fn reserve(len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: anonymous mapping at a kernel chosen address
        let p = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(p.cast::<u8>()).ok_or_else(io::Error::last_os_error)
    }

    /// Replaces `[ptr, ptr + len)` with fresh zeroed read-write pages.
    ///
    /// # Safety
    /// the range must lie inside a mapping obtained from [`reserve`]
    pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: MAP_FIXED over our own reservation
        let p = unsafe {
            libc::mmap(
                ptr.cast::<c_void>(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | MAP_FIXED,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Drops the backing pages of `[ptr, ptr + len)`, keeping the range reserved.
    ///
    /// # Safety
    /// the range must lie inside a mapping obtained from [`reserve`]
    pub unsafe fn uncommit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: MAP_FIXED over our own reservation
        let p = unsafe {
            libc::mmap(
                ptr.cast::<c_void>(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANON | MAP_FIXED | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    /// must be a whole mapping obtained from [`reserve`]
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { libc::munmap(ptr.cast::<c_void>(), len) };
    }

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            super::OS_PAGE_SIZE
        } else {
            size as usize
        }
    }
}

/// Fallback page size when the OS cannot be asked.
pub const OS_PAGE_SIZE: usize = 4096;

/// Size of a virtual memory page.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(unix::page_size)
}

/// Granularity at which address space can be reserved. Equal to the page
/// size on unix.
pub fn allocation_granularity() -> usize {
    page_size()
}

#[must_use = "a leaked reservation is never released"]
pub fn reserve_memory(size: usize) -> io::Result<NonNull<u8>> {
    unix::reserve(size)
}

/// Commits a page aligned range of a reservation. Committed memory reads as zero.
pub fn commit_memory(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    debug_assert!((ptr.as_ptr() as usize) % page_size() == 0);
    // SAFETY: callers only pass ranges of their own reservations
    unsafe { unix::commit(ptr.as_ptr(), size) }
}

pub fn uncommit_memory(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    debug_assert!((ptr.as_ptr() as usize) % page_size() == 0);
    // SAFETY: callers only pass ranges of their own reservations
    unsafe { unix::uncommit(ptr.as_ptr(), size) }
}

pub fn release_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from reserve_memory
    unsafe { unix::release(ptr.as_ptr(), size) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(allocation_granularity() >= page_size());
    }

    #[test]
    fn commit_zeroes_and_uncommit_resets() {
        let size = page_size() * 4;
        let base = reserve_memory(size).expect("reserve");

        commit_memory(base, size).expect("commit");
        // SAFETY: just committed
        unsafe {
            assert_eq!(*base.as_ptr(), 0);
            base.as_ptr().write_bytes(0xAB, size);
        }

        uncommit_memory(base, size).expect("uncommit");
        commit_memory(base, size).expect("recommit");
        // SAFETY: committed again
        let bytes = unsafe { std::slice::from_raw_parts(base.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0), "recommitted pages must be zero");

        release_memory(base, size);
    }
}
