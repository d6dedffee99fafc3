use std::io;
use std::ptr;

/// A fixed-size memory region backing one buffer slot.
///
/// Shared regions are anonymous `MAP_SHARED` mappings, so the same pages can
/// be handed to another execution context without copying. Heap regions are
/// the fallback when mapping is unavailable.
pub(crate) struct Region {
    ptr: *mut u8,
    len: usize,
    backing: Backing,
}

enum Backing {
    Mapped,
    Heap { _allocation: Box<[u8]> },
}

// SAFETY: A region is exclusively owned by its slot. Access to the bytes is
// serialized by the slot's atomic state, never by the region itself.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Maps an anonymous shared region of `len` bytes.
    #[cfg(unix)]
    pub(crate) fn map_shared(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
            backing: Backing::Mapped,
        })
    }

    #[cfg(not(unix))]
    pub(crate) fn map_shared(_len: usize) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "shared mappings are not available on this platform",
        ))
    }

    /// Allocates an ordinary heap region of `len` bytes.
    pub(crate) fn heap(len: usize) -> Self {
        let mut data = vec![0u8; len].into_boxed_slice();
        let ptr = data.as_mut_ptr();
        Self {
            ptr,
            len,
            backing: Backing::Heap { _allocation: data },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Mapped)
    }

    /// # Safety
    ///
    /// The caller must hold the slot that owns this region; no other
    /// reference to the bytes may exist for the returned lifetime.
    #[expect(clippy::mut_from_ref, reason = "Exclusivity is enforced by the slot state")]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// # Safety
    ///
    /// The caller must hold the slot that owns this region.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        #[cfg(unix)]
        if matches!(self.backing, Backing::Mapped) && !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
            }
            self.ptr = ptr::null_mut();
        }
    }
}
