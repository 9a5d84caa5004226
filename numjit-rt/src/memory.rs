//! Executable memory for generated code.
//!
//! A region starts life as a [`WritableRegion`]: mapped read/write and never
//! callable. [`WritableRegion::seal`] consumes it and returns an
//! [`ExecutableRegion`]: read/execute, with no write API at all. There is no
//! path back, so recompiling a function always maps a fresh region.
//!
//! On Apple Silicon the pages are mapped with `MAP_JIT` and the per-thread
//! write protection is lifted only for the duration of a write.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("cannot map {size} bytes of code memory: {source}")]
    Allocate {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot make code memory executable: {source}")]
    Protect {
        #[source]
        source: std::io::Error,
    },
    #[error("write of {len} bytes at offset {offset} overruns a {capacity}-byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

// ---------------------------------------------------------------------------
// Writable state
// ---------------------------------------------------------------------------

/// Freshly mapped code memory that can be written but not executed.
pub struct WritableRegion {
    ptr: NonNull<u8>,
    capacity: usize,
    /// High-water mark of bytes written.
    len: usize,
}

impl WritableRegion {
    /// Map at least `size` bytes (rounded up to whole pages, minimum one page).
    pub fn allocate(size: usize) -> Result<Self, MemoryError> {
        let page = sys::page_size();
        let capacity = size.max(1).div_ceil(page) * page;
        let ptr = sys::map(capacity).map_err(|source| {
            tracing::warn!(size = capacity, error = %source, "code memory allocation failed");
            MemoryError::Allocate {
                size: capacity,
                source,
            }
        })?;
        Ok(WritableRegion {
            ptr,
            capacity,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `bytes` into the region at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.capacity)
            .ok_or(MemoryError::OutOfBounds {
                offset,
                len: bytes.len(),
                capacity: self.capacity,
            })?;

        let _guard = sys::WriteWindow::open();
        // SAFETY: [offset, end) lies inside the mapping (checked above) and the
        // mapping is writable for this thread while `_guard` is alive.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        self.len = self.len.max(end);
        Ok(())
    }

    /// Flip the region to read/execute. Consumes the writable handle; on
    /// failure the mapping is released.
    pub fn seal(self) -> Result<ExecutableRegion, MemoryError> {
        let region = std::mem::ManuallyDrop::new(self);
        let (ptr, capacity, len) = (region.ptr, region.capacity, region.len);

        // SAFETY: ptr/capacity describe a live mapping owned by `region`, which
        // is never used again (ManuallyDrop) so ownership moves to the result.
        if let Err(source) = unsafe { sys::protect_exec(ptr, capacity) } {
            tracing::warn!(error = %source, "code memory protection change failed");
            unsafe { sys::unmap(ptr, capacity) };
            return Err(MemoryError::Protect { source });
        }
        unsafe { sys::flush_icache(ptr, len) };

        Ok(ExecutableRegion { ptr, capacity, len })
    }
}

impl Drop for WritableRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned exclusively by this handle.
        unsafe { sys::unmap(self.ptr, self.capacity) };
    }
}

// ---------------------------------------------------------------------------
// Executable state
// ---------------------------------------------------------------------------

/// Finalized code memory. Readable and executable, never writable.
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
}

// SAFETY: the region is immutable after sealing; sharing or moving the handle
// across threads only shares read/execute access to those pages.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    /// Allocate, fill and seal a region holding exactly `code`.
    pub fn load(code: &[u8]) -> Result<Self, MemoryError> {
        let mut region = WritableRegion::allocate(code.len())?;
        region.write(0, code)?;
        region.seal()
    }

    /// Address of `offset` within the region, or `None` past the written code.
    pub fn entry(&self, offset: usize) -> Option<*const u8> {
        // SAFETY: `offset < len <= capacity`, so the result stays inside the
        // mapping `ptr` points to.
        (offset < self.len).then(|| unsafe { self.ptr.as_ptr().add(offset) as *const u8 })
    }

    /// Bytes of code written before sealing.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The written code, for disassembly and tests.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes are initialized and stay mapped
        // readable for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned exclusively by this handle and no entry
        // pointer handed out by `entry` may outlive it.
        unsafe { sys::unmap(self.ptr, self.capacity) };
    }
}

impl std::fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Platform layer
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    const APPLE_SILICON: bool = cfg!(all(target_os = "macos", target_arch = "aarch64"));

    pub(super) fn page_size() -> usize {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n <= 0 { 4096 } else { n as usize }
    }

    pub(super) fn map(len: usize) -> io::Result<NonNull<u8>> {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        let (prot, flags) = (
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT,
        );
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        let (prot, flags) = (
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        );

        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
    }

    pub(super) unsafe fn protect_exec(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if APPLE_SILICON {
            // MAP_JIT pages are already RX for every thread whose write
            // protection is on, which is the default outside a WriteWindow.
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                ptr.as_ptr() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe extern "C" {
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
        fn sys_icache_invalidate(start: *mut libc::c_void, size: usize);
    }

    #[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
    unsafe extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }

    #[allow(unused_variables)]
    pub(super) unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        unsafe {
            sys_icache_invalidate(ptr.as_ptr() as *mut libc::c_void, len)
        };
        #[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
        unsafe {
            let start = ptr.as_ptr() as *mut libc::c_char;
            __clear_cache(start, start.add(len));
        }
        // x86 keeps instruction and data caches coherent.
    }

    /// Lifts the per-thread JIT write protection until dropped. A no-op
    /// everywhere except Apple Silicon.
    pub(super) struct WriteWindow;

    impl WriteWindow {
        pub(super) fn open() -> Self {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            unsafe {
                pthread_jit_write_protect_np(0)
            };
            WriteWindow
        }
    }

    impl Drop for WriteWindow {
        fn drop(&mut self) {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            unsafe {
                pthread_jit_write_protect_np(1)
            };
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn map(_len: usize) -> io::Result<NonNull<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "executable memory is only implemented for unix targets",
        ))
    }

    pub(super) unsafe fn unmap(_ptr: NonNull<u8>, _len: usize) {}

    pub(super) unsafe fn protect_exec(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub(super) unsafe fn flush_icache(_ptr: NonNull<u8>, _len: usize) {}

    pub(super) struct WriteWindow;

    impl WriteWindow {
        pub(super) fn open() -> Self {
            WriteWindow
        }
    }
}
