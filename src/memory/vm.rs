use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InvalidConfig(String),
    /// A request the allocator cannot express as a mapping: the size
    /// overflows or the alignment is wider than half a page.
    UnsupportedLayout(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "page mapping failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "page unmapping failed: {e}"),
            VmError::InvalidConfig(msg) => write!(f, "invalid allocator configuration: {msg}"),
            VmError::UnsupportedLayout(msg) => write!(f, "unsupported allocation request: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::ReleaseFailed(e) => Some(e),
            VmError::InvalidConfig(_) | VmError::UnsupportedLayout(_) => None,
        }
    }
}

/// Abstract interface for the page-mapping substrate.
pub(crate) trait VmOps {
    /// Map `size` bytes of anonymous, zero-filled, read/write memory.
    /// The returned pointer is aligned to [`page_size`](VmOps::page_size).
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a range previously returned by [`map`](VmOps::map), with the
    /// same `size`. Pointers into the range are invalid afterwards.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(not(unix), not(any(loom, miri))))]
compile_error!("binmalloc needs an mmap-capable (unix) target.");

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Every "mapping" is a page-aligned
// zeroed heap block, which keeps the address-masking invariant intact.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_PAGE_SIZE: usize = 4096;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        MOCK_PAGE_SIZE
    }
}

/// Number of pages covering `size` bytes.
#[inline]
pub(crate) fn pages_for(size: usize) -> usize {
    size.div_ceil(PlatformVmOps::page_size())
}
