//! mmap-backed memory arena for a buffer pool.
//!
//! One contiguous anonymous mapping carved into fixed-stride slots. 2 MB
//! hugepages are tried first when the mapping size allows it; regular pages
//! are the fallback.

use std::io;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// Size of a hugepage on the platforms we run on.
pub const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Slot alignment; buffers never share a cache line.
pub const SLOT_ALIGN: usize = 64;

pub struct Arena {
    base: NonNull<u8>,
    size: usize,
    stride: usize,
    slots: usize,
    hugepages: bool,
}

// SAFETY: the mapping is private to the process and only reached through
// slot pointers whose exclusive use is tracked by the owning pool.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map an arena of `slots` buffers of at least `slot_size` bytes each.
    pub fn new(slot_size: usize, slots: usize) -> io::Result<Self> {
        let stride = slot_size.next_multiple_of(SLOT_ALIGN);
        let size = stride
            .checked_mul(slots)
            .ok_or_else(|| io::Error::other("arena size overflow"))?;

        let (ptr, hugepages) = if size % HUGEPAGE_SIZE == 0 {
            Self::mmap(size, true).or_else(|_| Self::mmap(size, false))?
        } else {
            Self::mmap(size, false)?
        };

        tracing::debug!(
            size_kb = size / 1024,
            stride,
            slots,
            hugepages,
            "Buffer arena mapped"
        );

        Ok(Self {
            base: ptr,
            size,
            stride,
            slots,
            hugepages,
        })
    }

    fn mmap(size: usize, hugepages: bool) -> io::Result<(NonNull<u8>, bool)> {
        let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        if hugepages {
            flags |= MapFlags::MAP_HUGETLB;
        }

        // SAFETY: anonymous mapping at a kernel-chosen address, nothing
        // else in the process is affected.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into()
                    .map_err(|_| io::Error::other("zero-sized arena"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok((ptr.cast(), hugepages))
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn using_hugepages(&self) -> bool {
        self.hugepages
    }

    /// Pointer to the start of slot `index`.
    pub fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!((index as usize) < self.slots);
        // SAFETY: index < slots, so the offset stays inside the mapping.
        unsafe { self.base.add(index as usize * self.stride) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/size describe the mapping created in new().
        unsafe {
            let _ = munmap(self.base.cast(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_is_aligned() {
        let arena = Arena::new(1530, 4).unwrap();
        assert_eq!(arena.stride(), 1536);
        assert_eq!(arena.slots(), 4);
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let arena = Arena::new(100, 3).unwrap();
        let a = arena.slot_ptr(0).as_ptr() as usize;
        let b = arena.slot_ptr(1).as_ptr() as usize;
        let c = arena.slot_ptr(2).as_ptr() as usize;
        assert_eq!(b - a, arena.stride());
        assert_eq!(c - b, arena.stride());
    }

    #[test]
    fn test_slot_memory_is_writable() {
        let arena = Arena::new(64, 2).unwrap();
        // SAFETY: slot 1 is inside the mapping and not shared.
        unsafe {
            let p = arena.slot_ptr(1).as_ptr();
            p.write_bytes(0xab, 64);
            assert_eq!(*p.add(63), 0xab);
        }
    }
}
