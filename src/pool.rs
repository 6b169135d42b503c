//! The pool facade.
//!
//! A [`Pool`] is a [`Slab`] under the names of a conventional C-style
//! memory pool: `init`, `malloc`, `free`, `stat` and `size`.

use core::{alloc::Layout, ptr::NonNull};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    config::PoolConfig,
    slab::{Slab, SlabStats},
    BackingAllocator, Error, Raw,
};

/// Usage statistics for a [`Pool`].
pub type PoolStats = SlabStats;

/// A fixed-capacity memory pool.
#[derive(Debug)]
pub struct Pool<A: BackingAllocator> {
    slab: Slab<A>,
}

impl Pool<Raw> {
    /// Constructs a new `Pool` from raw pointers and initializes it.
    ///
    /// # Errors
    ///
    /// See [`Slab::new_raw`].
    ///
    /// # Safety
    ///
    /// See [`Slab::new_raw`]. The required layouts are given by
    /// [`Pool::metadata_layout`] and [`Pool::region_layout`].
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        config: PoolConfig,
    ) -> Result<Pool<Raw>, Error> {
        let slab = unsafe { Slab::new_raw(metadata, region, config)? };

        Ok(Pool { slab })
    }

    /// Decomposes the pool into its metadata and region pointers.
    ///
    /// # Safety
    ///
    /// See [`Slab::into_raw_parts`].
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        unsafe { self.slab.into_raw_parts() }
    }
}

#[cfg(any(feature = "alloc", test))]
impl Pool<Global> {
    /// Attempts to construct a new `Pool` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// See [`Slab::try_new`].
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(config: PoolConfig) -> Result<Pool<Global>, Error> {
        Slab::try_new(config).map(|slab| Pool { slab })
    }
}

impl<A: BackingAllocator> Pool<A> {
    /// Returns the layout requirements of the region managed by a pool with
    /// this configuration.
    ///
    /// # Errors
    ///
    /// See [`Slab::region_layout`].
    pub fn region_layout(config: &PoolConfig) -> Result<Layout, Error> {
        Slab::<A>::region_layout(config)
    }

    /// Returns the layout requirements of the metadata for a pool with this
    /// configuration.
    ///
    /// # Errors
    ///
    /// See [`Slab::metadata_layout`].
    pub fn metadata_layout(config: &PoolConfig) -> Result<Layout, Error> {
        Slab::<A>::metadata_layout(config)
    }

    /// Resets the pool. All outstanding allocations are forgotten.
    #[inline]
    pub fn init(&mut self) {
        self.slab.init();
    }

    /// Allocates `size` bytes.
    ///
    /// # Errors
    ///
    /// See [`Slab::allocate`].
    #[inline]
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        self.slab.allocate(size)
    }

    /// Frees an allocation made by [`malloc`](Self::malloc).
    ///
    /// # Errors
    ///
    /// See [`Slab::deallocate`].
    #[inline]
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.slab.deallocate(ptr)
    }

    /// Returns usage statistics.
    #[inline]
    pub fn stat(&self) -> PoolStats {
        self.slab.stat()
    }

    /// Returns the number of allocated bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.slab.size()
    }

    /// Returns the underlying slab allocator.
    #[inline]
    pub fn as_slab(&self) -> &Slab<A> {
        &self.slab
    }
}
