//! Executable memory with a two-phase lifecycle.
//!
//! An [`ExecutableBuffer<Writable>`] is mapped read/write and never
//! executable; [`ExecutableBuffer::seal`] flips it to read/execute and hands
//! back an [`ExecutableBuffer<Sealed>`], which is never writable. The mapping
//! is released on drop in either state.

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecMemoryError {
    #[error("mmap of {len} bytes failed: {source}")]
    Map {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("mprotect to read+execute failed: {0}")]
    Protect(#[source] std::io::Error),
}

/// Buffer state: bytes may be written, nothing may run.
#[derive(Debug)]
pub enum Writable {}

/// Buffer state: bytes may run, nothing may be written.
#[derive(Debug)]
pub enum Sealed {}

pub struct ExecutableBuffer<S> {
    ptr: NonNull<u8>,
    /// Mapped length, a whole number of pages.
    capacity: usize,
    _state: PhantomData<S>,
}

// SAFETY: the buffer owns its mapping exclusively and holds no
// thread-affine state, so it may move to another thread.
unsafe impl<S> Send for ExecutableBuffer<S> {}
// SAFETY: a sealed buffer is read-only; shared access never writes.
unsafe impl Sync for ExecutableBuffer<Sealed> {}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl ExecutableBuffer<Writable> {
    /// Map at least `min_len` bytes of read/write memory (one page minimum).
    pub fn new(min_len: usize) -> Result<Self, ExecMemoryError> {
        let page = page_size();
        let len = min_len.max(1).div_ceil(page) * page;
        // SAFETY: an anonymous private mapping with a null hint touches no
        // existing memory; failure is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ExecMemoryError::Map {
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ExecMemoryError::Map {
            len,
            source: std::io::Error::other("mmap returned null"),
        })?;
        debug!(len, address = ptr.as_ptr() as usize, "mapped writable code buffer");
        Ok(Self {
            ptr,
            capacity: len,
            _state: PhantomData,
        })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` maps `capacity` read/write bytes owned by `self`,
        // and `&mut self` makes this the only live view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Make the buffer read/execute. Write access is gone afterwards.
    pub fn seal(self) -> Result<ExecutableBuffer<Sealed>, ExecMemoryError> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `ptr` and `capacity` describe exactly the mapping this
        // buffer owns, and no slice borrowed from it outlives `self`.
        let rc = unsafe {
            libc::mprotect(
                this.ptr.as_ptr().cast(),
                this.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Re-own the mapping so it is unmapped on the error path.
            drop(ManuallyDrop::into_inner(this));
            return Err(ExecMemoryError::Protect(err));
        }
        flush_instruction_cache(this.ptr.as_ptr(), this.capacity);
        debug!(
            len = this.capacity,
            address = this.ptr.as_ptr() as usize,
            "sealed code buffer"
        );
        Ok(ExecutableBuffer {
            ptr: this.ptr,
            capacity: this.capacity,
            _state: PhantomData,
        })
    }
}

impl ExecutableBuffer<Sealed> {
    /// Reinterpret the code at `offset` as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must be a function pointer type whose signature and calling
    /// convention match the code at `offset`, and the returned pointer must
    /// not outlive this buffer.
    pub unsafe fn function<F: Copy>(&self, offset: usize) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const u8>(),
            "F must be a function pointer"
        );
        assert!(offset < self.capacity, "entry offset {offset} out of bounds");
        // SAFETY: `offset` is inside the mapping; the caller guarantees `F`
        // is a pointer-sized function type matching the code there.
        let entry = self.ptr.as_ptr().add(offset) as *const u8;
        std::mem::transmute_copy::<*const u8, F>(&entry)
    }
}

impl<S> ExecutableBuffer<S> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Address of the first byte, as code placed here will observe it.
    pub fn base_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable in both states and lives as long
        // as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }
}

impl<S> Drop for ExecutableBuffer<S> {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `mmap` with this length and is
        // unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.capacity);
        }
    }
}

impl<S> std::fmt::Debug for ExecutableBuffer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableBuffer")
            .field("address", &self.ptr.as_ptr())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_instruction_cache(start: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    // SAFETY: `start..start + len` is the mapping just sealed.
    unsafe { __clear_cache(start.cast(), start.add(len).cast()) }
}

// x86-64 keeps instruction fetch coherent with stores.
#[cfg(not(target_arch = "aarch64"))]
fn flush_instruction_cache(_start: *mut u8, _len: usize) {}
