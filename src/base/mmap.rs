use core::{mem::ManuallyDrop, ptr::NonNull};
use std::{alloc::Layout, io};

use memmap2::MmapMut;

use super::{BaseAlloc, Chunk};

/// The base allocator backed by anonymous memory mappings.
///
/// Mappings are page-aligned and returned to the kernel when the owning
/// pool dies. Layouts requesting a stricter alignment than one page are
/// rejected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mmap;

const PAGE_SIZE: usize = 4096;

// SAFETY: an anonymous mapping is a valid, exclusively owned block.
unsafe impl BaseAlloc for Mmap {
    type Handle = ManuallyDrop<MmapMut>;
    type Error = io::Error;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        if layout.align() > PAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "alignment beyond one page is not supported by the mmap base",
            ));
        }
        let mut map = MmapMut::map_anon(layout.size())?;
        let ptr = NonNull::new(map.as_mut_ptr()).expect("anonymous mapping at address zero");
        // SAFETY: the mapping is an owned block of `layout.size()` bytes,
        // page-aligned and therefore aligned to `layout.align()`.
        Ok(unsafe { Chunk::new(ptr, layout, ManuallyDrop::new(map)) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        // SAFETY: the handle is initialized and never touched again; the
        // `ManuallyDrop` field itself drops as a no-op afterwards.
        unsafe { ManuallyDrop::drop(&mut chunk.handle) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_chunk_is_writable() {
        let layout = Layout::from_size_align(8192, 64).unwrap();
        let chunk = Mmap.allocate(layout).unwrap();
        assert_eq!(chunk.pointer().as_ptr() as usize % 64, 0);
        // SAFETY: the chunk owns at least 8192 writable bytes.
        unsafe {
            chunk.pointer().write_bytes(0xa5, layout.size());
            assert_eq!(chunk.pointer().add(8191).read(), 0xa5);
        }
    }

    #[test]
    fn over_aligned_layouts_are_rejected() {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE * 2).unwrap();
        assert!(Mmap.allocate(layout).is_err());
    }
}
