//! Paged slab allocation.
//!
//! A [`Slab`] divides its managed region into equally-sized pages. Each page
//! is managed by its own [`Buddy`] allocator, and a packed array of 2-bit
//! codes records whether each page is empty, partially used, full, or part
//! of a *raw span*.
//!
//! Requests no larger than a page are served first-fit by the buddy of the
//! first empty or partial page with room for them. Larger requests reserve
//! the first run of contiguous empty pages long enough to hold the request
//! plus a small header recording the length of the run. Raw spans bypass
//! the buddy layer entirely.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                  |
//! |--------------------------|-----------|-----------------------------|
//! | Allocate (≤ page)        | O(1)      | O(pages × blocks per page)  |
//! | Allocate (> page)        | O(pages)  | O(pages)                    |
//! | Deallocate (≤ page)      | O(1)      | O(log blocks)               |
//! | Deallocate (> page)      | O(span)   | O(span)                     |
//!
//! #### Fragmentation
//!
//! Small allocations suffer the internal fragmentation of the buddy layer.
//! Raw spans need *contiguous* empty pages, so a request may fail even when
//! enough empty pages exist in total.

use core::{
    alloc::Layout,
    fmt,
    mem::ManuallyDrop,
    ptr::{self, NonNull},
    slice,
};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    base::BasePtr, bits::Bitmap, buddy::Buddy, config::PoolConfig, BackingAllocator, Error, Raw,
};

/// The state of one page of a [`Slab`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageState {
    /// No allocation in the page.
    Empty = 0,
    /// Some, but not all, of the page is allocated.
    Partial = 1,
    /// The page is fully allocated.
    Full = 2,
    /// The page belongs to an allocation larger than a page.
    Raw = 3,
}

impl PageState {
    #[inline]
    fn from_code(code: u8) -> PageState {
        match code & 0b11 {
            0 => PageState::Empty,
            1 => PageState::Partial,
            2 => PageState::Full,
            _ => PageState::Raw,
        }
    }

    /// Classifies a buddy-managed page by its occupancy.
    #[inline]
    fn of(buddy: &Buddy) -> PageState {
        if buddy.is_empty() {
            PageState::Empty
        } else if buddy.is_full() {
            PageState::Full
        } else {
            PageState::Partial
        }
    }
}

/// Usage statistics for a [`Slab`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SlabStats {
    /// Size of the managed region, in bytes.
    pub size: usize,
    /// Bytes currently allocated, including rounding and whole raw pages.
    pub used: usize,
    /// Number of pages.
    pub n_pages: usize,
    /// Number of empty pages.
    pub n_pages_empty: usize,
    /// Number of partially allocated pages.
    pub n_pages_partial: usize,
    /// Number of fully allocated pages.
    pub n_pages_full: usize,
    /// Number of pages belonging to raw spans.
    pub n_pages_raw: usize,
}

/// Where each structure lives in the metadata region.
struct MetadataLayout {
    layout: Layout,
    states_ofs: usize,
    heads_ofs: usize,
    trees_ofs: usize,
    tree_size: usize,
}

impl MetadataLayout {
    fn new(config: &PoolConfig) -> Result<MetadataLayout, Error> {
        config.validate()?;

        let num_pages = config.num_pages();
        let tree_size = Buddy::tree_layout(config.page_size, config.block_size)?.size();

        let buddies = Layout::array::<Buddy>(num_pages).map_err(|_| Error::InvalidPool)?;
        let states = num_pages
            .checked_mul(2)
            .ok_or(Error::InvalidPool)
            .and_then(|bits| Bitmap::map_layout(bits).map_err(|_| Error::InvalidPool))?;
        let heads = Bitmap::map_layout(num_pages).map_err(|_| Error::InvalidPool)?;
        let trees = tree_size
            .checked_mul(num_pages)
            .ok_or(Error::InvalidPool)
            .and_then(|len| Layout::array::<u8>(len).map_err(|_| Error::InvalidPool))?;

        let (layout, states_ofs) = buddies.extend(states).map_err(|_| Error::InvalidPool)?;
        let (layout, heads_ofs) = layout.extend(heads).map_err(|_| Error::InvalidPool)?;
        let (layout, trees_ofs) = layout.extend(trees).map_err(|_| Error::InvalidPool)?;

        Ok(MetadataLayout {
            layout: layout.pad_to_align(),
            states_ofs,
            heads_ofs,
            trees_ofs,
            tree_size,
        })
    }
}

/// A slab allocator whose pages are subdivided by buddy allocators.
pub struct Slab<A: BackingAllocator> {
    base: BasePtr,
    metadata: NonNull<u8>,
    config: PoolConfig,
    /// One buddy per page, stored in the metadata region.
    buddies: NonNull<Buddy>,
    /// One 2-bit `PageState` code per page.
    states: Bitmap,
    /// Marks the first page of each raw span.
    heads: Bitmap,
    backing_allocator: A,
}

impl Slab<Raw> {
    /// Constructs a new `Slab` from raw pointers and initializes it.
    ///
    /// For a discussion of slab allocation, see the [module-level
    /// documentation].
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid (see
    /// [`PoolConfig::validate`]), or [`Error::InvalidPool`] if either region
    /// would not fit in the address space or `metadata` is not suitably
    /// aligned.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for the size of the
    ///   [`Layout`] returned by [`Self::region_layout(config)`].
    /// - `metadata` must be valid for reads and writes for the size of the
    ///   [`Layout`] returned by [`Self::metadata_layout(config)`].
    /// - Both regions must outlive the returned `Slab`, and must not be
    ///   accessed except through it, apart from memory it has allocated.
    ///
    /// [module-level documentation]: crate::slab
    /// [`Self::region_layout(config)`]: Slab::region_layout
    /// [`Self::metadata_layout(config)`]: Slab::metadata_layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        config: PoolConfig,
    ) -> Result<Slab<Raw>, Error> {
        unsafe { RawSlab::try_new(metadata, region, config).map(|s| s.with_backing_allocator(Raw)) }
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the metadata pointer and the region
    /// pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// the returned region pointer becomes the sole owner of the region that
    /// was used to construct the allocator. As such, all allocations made from
    /// this allocator should be either freed or forgotten before calling this
    /// method.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        let slab = ManuallyDrop::new(self);

        (slab.metadata, slab.base.ptr())
    }
}

#[cfg(any(feature = "alloc", test))]
impl Slab<Global> {
    /// Attempts to construct a new `Slab` backed by the global allocator.
    ///
    /// In particular, the memory managed by this `Slab` and its metadata are
    /// allocated from the global allocator according to the layouts indicated
    /// by [`Self::region_layout(config)`] and
    /// [`Self::metadata_layout(config)`].
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid, or [`Error::OutOfMemory`] if
    /// sufficient memory could not be allocated from the global allocator.
    ///
    /// [`Self::region_layout(config)`]: Slab::region_layout
    /// [`Self::metadata_layout(config)`]: Slab::metadata_layout
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(config: PoolConfig) -> Result<Slab<Global>, Error> {
        let region_layout = Self::region_layout(&config)?;
        let metadata_layout = Self::metadata_layout(&config)?;

        unsafe {
            // SAFETY: both layouts have a nonzero size because the pool holds
            // at least one page.
            let region =
                NonNull::new(alloc::alloc::alloc(region_layout)).ok_or(Error::OutOfMemory)?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(Error::OutOfMemory);
                }
            };

            match RawSlab::try_new(metadata, region, config) {
                Ok(s) => Ok(s.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A> Slab<A>
where
    A: BackingAllocator,
{
    /// Returns the layout requirements of the region managed by a `Slab`
    /// with this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the region cannot be
    /// represented as a [`Layout`].
    pub fn region_layout(config: &PoolConfig) -> Result<Layout, Error> {
        config.validate()?;

        Layout::from_size_align(config.pool_size, config.block_size).map_err(|_| Error::InvalidPool)
    }

    /// Returns the layout requirements of the metadata region for a `Slab`
    /// with this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the metadata cannot be
    /// represented as a [`Layout`].
    pub fn metadata_layout(config: &PoolConfig) -> Result<Layout, Error> {
        MetadataLayout::new(config).map(|m| m.layout)
    }

    /// Returns the configuration of this allocator.
    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns a pointer to the start of the managed region.
    #[inline]
    pub fn region(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    #[inline]
    fn num_pages(&self) -> usize {
        self.config.num_pages()
    }

    #[inline]
    fn buddies(&self) -> &[Buddy] {
        // SAFETY: `buddies` points to `num_pages` initialized values in the
        // metadata region, which is borrowed through `self`.
        unsafe { slice::from_raw_parts(self.buddies.as_ptr(), self.num_pages()) }
    }

    #[inline]
    fn buddies_mut(&mut self) -> &mut [Buddy] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.buddies.as_ptr(), self.num_pages()) }
    }

    #[inline]
    fn state(&self, page: usize) -> PageState {
        PageState::from_code(self.states.get_pair(page))
    }

    #[inline]
    fn set_state(&mut self, page: usize, state: PageState) {
        self.states.set_pair(page, state as u8);
    }

    /// Returns the state of the page at index `page`, or `None` if the index
    /// is out of range.
    pub fn page_state(&self, page: usize) -> Option<PageState> {
        (page < self.num_pages()).then(|| self.state(page))
    }

    /// Returns the buddy allocator managing the page at index `page`, or
    /// `None` if the index is out of range.
    ///
    /// The buddy of a page inside a raw span is always empty.
    pub fn buddy(&self, page: usize) -> Option<&Buddy> {
        self.buddies().get(page)
    }

    /// Resets the allocator, marking every page empty.
    ///
    /// All outstanding allocations are forgotten.
    pub fn init(&mut self) {
        self.states.fill(false);
        self.heads.fill(false);

        for buddy in self.buddies_mut() {
            buddy.init();
        }

        log::debug!(
            "slab {:#x}: initialized {} pages of {} bytes ({} byte blocks)",
            self.base.addr().get(),
            self.num_pages(),
            self.config.page_size,
            self.config.block_size
        );
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// Requests no larger than a page are placed in a page's buddy allocator
    /// and rounded up to a power-of-two number of blocks. Larger requests
    /// reserve a raw span of whole pages.
    ///
    /// The returned pointer is aligned to the block size relative to the
    /// start of the managed region. The contents of the memory are
    /// unspecified.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is zero.
    /// - [`Error::OutOfMemory`] if no page, or no run of contiguous empty
    ///   pages, can hold the request. The allocator is unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }

        if size > self.config.page_size {
            return self.allocate_span(size);
        }

        for page in 0..self.num_pages() {
            if !matches!(self.state(page), PageState::Empty | PageState::Partial) {
                continue;
            }

            let buddy = &mut self.buddies_mut()[page];
            if buddy.free_bytes() < size {
                continue;
            }

            let res = buddy.allocate(size);
            let state = PageState::of(buddy);

            match res {
                Ok(ptr) => {
                    self.set_state(page, state);
                    return Ok(ptr);
                }

                // Enough free bytes, but too fragmented; try the next page.
                Err(Error::OutOfMemory) => continue,

                Err(e) => return Err(e),
            }
        }

        log::trace!(
            "slab {:#x}: no page can hold {} bytes",
            self.base.addr().get(),
            size
        );

        Err(Error::OutOfMemory)
    }

    /// Finds the first run of `len` contiguous empty pages.
    fn find_empty_run(&self, len: usize) -> Option<usize> {
        let mut run = 0;

        for page in 0..self.num_pages() {
            if self.state(page) == PageState::Empty {
                run += 1;
                if run == len {
                    return Some(page + 1 - len);
                }
            } else {
                run = 0;
            }
        }

        None
    }

    fn allocate_span(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let page_size = self.config.page_size;
        let header = self.config.header_size();

        let num_pages = size
            .checked_add(header)
            .ok_or(Error::OutOfMemory)?
            .div_ceil(page_size);

        let first = self.find_empty_run(num_pages).ok_or(Error::OutOfMemory)?;
        let span_ofs = first * page_size;

        let span = self.base.with_offset(span_ofs).ok_or(Error::OutOfMemory)?;
        let ptr = self
            .base
            .with_offset(span_ofs + header)
            .ok_or(Error::OutOfMemory)?;

        // SAFETY: the header lies within the span, which is unallocated and
        // owned by this allocator.
        unsafe { span.cast::<usize>().as_ptr().write_unaligned(num_pages) };

        for page in first..first + num_pages {
            self.set_state(page, PageState::Raw);
        }
        self.heads.set(first, true);

        log::trace!(
            "slab {:#x}: reserved {} pages at page {} for {} bytes",
            self.base.addr().get(),
            num_pages,
            first,
            size
        );

        Ok(ptr)
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPointer`] if `ptr` lies outside the managed
    /// region, is not the base address of a live allocation, or was already
    /// freed. The allocator is unchanged on error.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        let ofs = self
            .base
            .offset_to(ptr.addr())
            .ok_or(Error::InvalidPointer)?;
        let page = ofs / self.config.page_size;

        match self.state(page) {
            PageState::Empty => {
                log::debug!(
                    "slab {:#x}: free of {:p} in empty page {}",
                    self.base.addr().get(),
                    ptr,
                    page
                );
                Err(Error::InvalidPointer)
            }

            PageState::Partial | PageState::Full => {
                let buddy = &mut self.buddies_mut()[page];
                buddy.deallocate(ptr)?;
                let state = PageState::of(buddy);

                self.set_state(page, state);
                Ok(())
            }

            PageState::Raw => self.free_span(ofs),
        }
    }

    fn free_span(&mut self, ofs: usize) -> Result<(), Error> {
        let page_size = self.config.page_size;
        let num_pages = self.num_pages();

        let span_ofs = ofs
            .checked_sub(self.config.header_size())
            .filter(|span_ofs| span_ofs % page_size == 0)
            .ok_or(Error::InvalidPointer)?;
        let first = span_ofs / page_size;

        if !self.heads.get(first) || self.state(first) != PageState::Raw {
            log::debug!(
                "slab {:#x}: free of offset {:#x} inside a raw span",
                self.base.addr().get(),
                ofs
            );
            return Err(Error::InvalidPointer);
        }

        let span = self
            .base
            .with_offset(span_ofs)
            .ok_or(Error::InvalidPointer)?;

        // SAFETY: the header was written when the span was reserved, and lies
        // within the managed region.
        let len = unsafe { span.cast::<usize>().as_ptr().read_unaligned() };

        // Reject a header that disagrees with the page states.
        let end = first
            .checked_add(len)
            .filter(|&end| len > 0 && end <= num_pages)
            .ok_or(Error::InvalidPointer)?;
        let is_span = (first..end).all(|page| self.state(page) == PageState::Raw)
            && !(first + 1..end).any(|page| self.heads.get(page))
            && (end == num_pages || self.state(end) != PageState::Raw || self.heads.get(end));
        if !is_span {
            log::debug!(
                "slab {:#x}: corrupt header for span at page {}",
                self.base.addr().get(),
                first
            );
            return Err(Error::InvalidPointer);
        }

        for page in first..end {
            self.set_state(page, PageState::Empty);
        }
        self.heads.set(first, false);

        log::trace!(
            "slab {:#x}: released {} pages at page {}",
            self.base.addr().get(),
            len,
            first
        );

        Ok(())
    }

    /// Returns usage statistics.
    ///
    /// Partial pages are measured by walking their buddy trees; full pages
    /// and raw pages count as a whole page each.
    pub fn stat(&self) -> SlabStats {
        let mut stats = SlabStats {
            size: self.config.pool_size,
            n_pages: self.num_pages(),
            ..SlabStats::default()
        };

        for (page, buddy) in self.buddies().iter().enumerate() {
            match self.state(page) {
                PageState::Empty => stats.n_pages_empty += 1,
                PageState::Partial => {
                    stats.n_pages_partial += 1;
                    stats.used += buddy.size();
                }
                PageState::Full => {
                    stats.n_pages_full += 1;
                    stats.used += self.config.page_size;
                }
                PageState::Raw => {
                    stats.n_pages_raw += 1;
                    stats.used += self.config.page_size;
                }
            }
        }

        stats
    }

    /// Returns the number of allocated bytes, as reported by
    /// [`stat`](Self::stat).
    pub fn size(&self) -> usize {
        self.buddies()
            .iter()
            .enumerate()
            .map(|(page, buddy)| match self.state(page) {
                PageState::Empty => 0,
                PageState::Partial => buddy.size(),
                PageState::Full | PageState::Raw => self.config.page_size,
            })
            .sum()
    }
}

impl<A> fmt::Debug for Slab<A>
where
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("base", &self.base.ptr())
            .field("config", &self.config)
            .field("stats", &self.stat())
            .finish()
    }
}

impl<A> Drop for Slab<A>
where
    A: BackingAllocator,
{
    fn drop(&mut self) {
        // Both layouts were checked when the allocator was constructed.
        if let (Ok(region_layout), Ok(metadata_layout)) = (
            Self::region_layout(&self.config),
            Self::metadata_layout(&self.config),
        ) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.base.ptr(), region_layout);
                self.backing_allocator
                    .deallocate(self.metadata, metadata_layout);
            }
        }
    }
}

/// Like a `Slab`, but without a `Drop` impl or an associated allocator.
struct RawSlab {
    base: BasePtr,
    metadata: NonNull<u8>,
    config: PoolConfig,
    buddies: NonNull<Buddy>,
    states: Bitmap,
    heads: Bitmap,
}

impl RawSlab {
    /// Attempts to construct and initialize a slab from raw pointers.
    ///
    /// # Safety
    ///
    /// See [`Slab::new_raw`].
    unsafe fn try_new(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        config: PoolConfig,
    ) -> Result<RawSlab, Error> {
        let meta = MetadataLayout::new(&config)?;

        let base = BasePtr::new(region, config.pool_size).ok_or(Error::InvalidPool)?;
        if metadata.as_ptr().align_offset(meta.layout.align()) != 0 {
            return Err(Error::InvalidPool);
        }
        BasePtr::new(metadata, meta.layout.size()).ok_or(Error::InvalidPool)?;

        let num_pages = config.num_pages();
        let meta_ptr = metadata.as_ptr();

        // SAFETY: every offset lies within the metadata layout, which the
        // caller guarantees is valid for reads and writes.
        let (states, heads, trees) = unsafe {
            (
                Bitmap::new(2 * num_pages, meta_ptr.add(meta.states_ofs)),
                Bitmap::new(num_pages, meta_ptr.add(meta.heads_ofs)),
                meta_ptr.add(meta.trees_ofs),
            )
        };

        let buddies = metadata.cast::<Buddy>();
        for page in 0..num_pages {
            let page_base = base
                .subregion(page * config.page_size, config.page_size)
                .ok_or(Error::InvalidPool)?;

            // SAFETY: each page owns a disjoint `tree_size`-byte slice of the
            // tree storage, and the buddy array has room for `num_pages`
            // entries.
            unsafe {
                let tree = trees.add(page * meta.tree_size);
                let buddy = Buddy::from_parts(tree, page_base, config.block_size);
                ptr::write(buddies.as_ptr().add(page), buddy);
            }
        }

        log::debug!(
            "slab {:#x}: {} pages of {} bytes, {} bytes of metadata",
            base.addr().get(),
            num_pages,
            config.page_size,
            meta.layout.size()
        );

        Ok(RawSlab {
            base,
            metadata,
            config,
            buddies,
            states,
            heads,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Slab<A> {
        let RawSlab {
            base,
            metadata,
            config,
            buddies,
            states,
            heads,
        } = self;

        Slab {
            base,
            metadata,
            config,
            buddies,
            states,
            heads,
            backing_allocator,
        }
    }
}
