//! The module of base allocators.
//!
//! See [`BaseAlloc`] for more information.

#[cfg(feature = "base-mmap")]
mod mmap;

use core::{fmt, ptr::NonNull};
use std::alloc::Layout;

#[cfg(feature = "base-mmap")]
pub use self::mmap::Mmap;

/// The trait of base allocators.
///
/// Pools obtain shard memory at a coarse granularity through a base
/// allocator and release it only when the pool itself dies; a backing
/// allocation failure is the only error this crate surfaces.
///
/// Base allocators are shared across threads, and their chunks migrate
/// between threads along with recycled pools, hence the `Send + Sync`
/// requirements.
///
/// # Safety
///
/// `allocate` must return a valid, exclusively owned memory block
/// satisfying `layout`.
pub unsafe trait BaseAlloc: Clone + Send + Sync {
    /// The opaque handle of this allocator, usually its metadata or for
    /// RAII purposes.
    type Handle: Send;
    /// The error returned when an allocation fails.
    type Error: fmt::Debug + fmt::Display;

    /// Allocates a memory [`Chunk`] of `layout`.
    ///
    /// # Errors
    ///
    /// Errors are returned when the backing memory is exhausted. The
    /// failure is propagated as-is; nothing in this crate retries.
    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error>;

    /// Deallocates a memory [`Chunk`].
    ///
    /// # Safety
    ///
    /// `chunk` must have been allocated by this allocator and must not be
    /// used any longer after the deallocation.
    unsafe fn deallocate(chunk: &mut Chunk<Self>);
}

/// The base allocator backed by the system allocator (`std::alloc`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sys;

/// The error returned when the system allocator is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory(Layout);

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the system allocator failed to serve {} bytes",
            self.0.size()
        )
    }
}

impl std::error::Error for OutOfMemory {}

// SAFETY: `std::alloc::alloc` returns a valid, exclusively owned block on
// success.
unsafe impl BaseAlloc for Sys {
    type Handle = ();
    type Error = OutOfMemory;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        debug_assert!(layout.size() > 0);
        // SAFETY: `layout` is never zero-sized.
        let ptr = unsafe { std::alloc::alloc(layout) };
        match NonNull::new(ptr) {
            // SAFETY: the block was just allocated with `layout`.
            Some(ptr) => Ok(unsafe { Chunk::new(ptr, layout, ()) }),
            None => Err(OutOfMemory(layout)),
        }
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        // SAFETY: `chunk` was allocated by `std::alloc::alloc` with this
        // very layout.
        unsafe { std::alloc::dealloc(chunk.pointer().as_ptr(), chunk.layout()) }
    }
}

/// An owned representation of a valid memory block. Implementations like
/// `Clone` and `Copy` are banned for its unique ownership.
pub struct Chunk<B: BaseAlloc> {
    ptr: NonNull<u8>,
    layout: Layout,
    /// The handle of the base allocator this chunk came from.
    pub handle: B::Handle,
}

// SAFETY: a chunk owns its memory block.
unsafe impl<B: BaseAlloc> Send for Chunk<B> where B::Handle: Send {}
unsafe impl<B: BaseAlloc> Sync for Chunk<B> where B::Handle: Sync {}

impl<B: BaseAlloc> Chunk<B> {
    /// Creates a memory chunk manually. This function should only be used
    /// by an implementation of a base allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid & owned block of memory of `layout`,
    /// allocated by the allocator `handle` belongs to.
    pub unsafe fn new(ptr: NonNull<u8>, layout: Layout, handle: B::Handle) -> Self {
        Chunk { ptr, layout, handle }
    }

    /// Retrieves the layout information of this chunk.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Retrieves the pointer of this chunk.
    pub fn pointer(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl<B: BaseAlloc> Drop for Chunk<B> {
    fn drop(&mut self) {
        // SAFETY: the chunk owns a block previously allocated by `B`.
        unsafe { B::deallocate(self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_chunk_is_writable() {
        let layout = Layout::from_size_align(256, 16).unwrap();
        let chunk = Sys.allocate(layout).unwrap();
        assert_eq!(chunk.layout(), layout);
        assert_eq!(chunk.pointer().as_ptr() as usize % 16, 0);
        // SAFETY: the chunk owns at least 256 writable bytes.
        unsafe {
            chunk.pointer().write_bytes(0xf, layout.size());
            assert_eq!(chunk.pointer().add(255).read(), 0xf);
        }
    }
}
