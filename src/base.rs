use core::{num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Every pointer handed out by an allocator is derived from its `BasePtr`,
/// so that it carries the provenance of the region the caller supplied.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// Returns `None` if the region would extend past the end of the address
    /// space.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(self) -> usize {
        // Checked at construction.
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Calculates the offset from `self` to `addr`, if `addr` lies within
    /// the region.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> Option<usize> {
        self.contains_addr(addr)
            .then(|| addr.get() - self.ptr.addr().get())
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.extent {
            return None;
        }

        // Cannot overflow: offset < extent, and base + extent was checked at
        // construction.
        let addr = NonZeroUsize::new(self.ptr.addr().get() + offset)?;

        Some(self.ptr.with_addr(addr))
    }

    /// Returns a `BasePtr` for the `extent`-byte subregion starting `offset`
    /// bytes from this one.
    #[inline]
    pub fn subregion(self, offset: usize, extent: usize) -> Option<BasePtr> {
        let end = offset.checked_add(extent)?;
        if end > self.extent {
            return None;
        }

        let ptr = self.with_offset(offset)?;

        Some(BasePtr { ptr, extent })
    }
}
