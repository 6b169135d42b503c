//! Binary-buddy allocation within a single page.
//!
//! A [`Buddy`] manages one page of `page_size` bytes, divided into
//! `page_size / block_size` blocks. Allocations are power-of-two runs of
//! blocks, tracked by a complete binary tree stored as a bitmap: the root is
//! node 1, the children of node `i` are `2i` and `2i + 1`, and the leaves
//! (one per block) are nodes `B..2B`.
//!
//! A set bit marks a free node. An allocation placed at node `n` clears `n`
//! and all of its ancestors, and leaves the bits below `n` untouched. A clear
//! node whose children are both set (or a clear leaf) is therefore the base
//! of an allocation, while a clear node with a clear child is *split*: some,
//! but not all, of its blocks are in use.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case          |
//! |--------------------------|-----------|---------------------|
//! | Allocate                 | O(1)      | O(blocks per page)  |
//! | Deallocate               | O(1)      | O(log blocks)       |
//! | Statistics               | O(1)      | O(blocks per page)  |
//!
//! #### Fragmentation
//!
//! Allocation sizes are rounded up to a power-of-two number of blocks, so
//! up to half of an allocation may be lost to internal fragmentation.
//! Adjacent free buddies are merged as soon as both are free.

use core::{alloc::Layout, fmt, ptr::NonNull};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use crate::{
    base::BasePtr,
    bits::{log2, pow2, round_up_pow2, Bitmap},
    config::validate_page,
    Error,
};

/// Index of the root node.
const ROOT: usize = 1;

/// Usage statistics for a single [`Buddy`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Size of the page, in bytes.
    pub size: usize,
    /// Bytes currently allocated, including rounding.
    pub used: usize,
    /// Number of blocks in the page.
    pub n_blocks: usize,
    /// Number of blocks currently allocated.
    pub n_blocks_used: usize,
}

/// A binary-buddy allocator over one page.
pub struct Buddy {
    base: BasePtr,
    block_size: usize,
    depth: u32,
    /// Number of blocks covered by live allocations.
    allocated: usize,
    tree: Bitmap,
}

impl Buddy {
    /// Returns the layout of the tree storage for a page of this geometry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSize`] if the sizes are not powers of two or
    /// the page is smaller than a block, and [`Error::InvalidPool`] if the
    /// layout cannot be represented.
    pub fn tree_layout(page_size: usize, block_size: usize) -> Result<Layout, Error> {
        validate_page(page_size, block_size)?;

        Bitmap::map_layout(Self::tree_bits(page_size / block_size)).map_err(|_| Error::InvalidPool)
    }

    /// Constructs a new `Buddy` from raw pointers and initializes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid (see
    /// [`tree_layout`](Self::tree_layout)), or [`Error::InvalidPool`] if the
    /// page would extend past the end of the address space.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `tree` must be valid for reads and writes for the size of the
    ///   [`Layout`] returned by [`Self::tree_layout(page_size, block_size)`].
    /// - `region` must be valid for reads and writes for `page_size` bytes.
    /// - Both regions must outlive the returned `Buddy` and must not be
    ///   accessed except through it, apart from memory it has allocated.
    ///
    /// [`Self::tree_layout(page_size, block_size)`]: Self::tree_layout
    pub unsafe fn new_raw(
        tree: NonNull<u8>,
        region: NonNull<u8>,
        page_size: usize,
        block_size: usize,
    ) -> Result<Buddy, Error> {
        validate_page(page_size, block_size)?;
        let base = BasePtr::new(region, page_size).ok_or(Error::InvalidPool)?;

        Ok(unsafe { Buddy::from_parts(tree.as_ptr(), base, block_size) })
    }

    /// Constructs and initializes a `Buddy` over `base`.
    ///
    /// # Safety
    ///
    /// The geometry must already be validated, and `tree` must satisfy the
    /// requirements of [`Buddy::new_raw`].
    pub(crate) unsafe fn from_parts(tree: *mut u8, base: BasePtr, block_size: usize) -> Buddy {
        let num_blocks = base.extent() / block_size;
        let tree = unsafe { Bitmap::new(Self::tree_bits(num_blocks), tree) };

        let mut buddy = Buddy {
            base,
            block_size,
            depth: log2(num_blocks),
            allocated: 0,
            tree,
        };
        buddy.init();
        buddy
    }

    /// The tree has one node per index in `1..2B`; index 0 is unused.
    #[inline]
    fn tree_bits(num_blocks: usize) -> usize {
        2 * num_blocks
    }

    /// Resets the allocator, marking the whole page free.
    ///
    /// All outstanding allocations are forgotten.
    pub fn init(&mut self) {
        self.tree.fill(true);
        self.tree.set(0, false);
        self.allocated = 0;
    }

    /// Returns a pointer to the start of the page.
    #[inline]
    pub fn region(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Returns the size of the page, in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.base.extent()
    }

    /// Returns the size of a block, in bytes.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of blocks in the page.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        pow2(self.depth)
    }

    /// Returns the number of blocks covered by live allocations.
    #[inline]
    pub fn allocated_blocks(&self) -> usize {
        self.allocated
    }

    /// Returns the number of bytes covered by live allocations.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated * self.block_size
    }

    /// Returns the number of bytes not covered by live allocations.
    ///
    /// Free memory may be fragmented, so an allocation of this size is not
    /// guaranteed to succeed.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.allocated_bytes()
    }

    /// Returns `true` if no allocations are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Returns `true` if every block is allocated.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.allocated == self.num_blocks()
    }

    /// Returns the tree level whose nodes are the smallest blocks that can
    /// hold `size` bytes, or `None` if `size` exceeds the page.
    fn level_for(&self, size: usize) -> Option<u32> {
        if size > self.capacity() {
            return None;
        }

        let blocks = round_up_pow2(size.div_ceil(self.block_size))?;

        Some(self.depth - log2(blocks))
    }

    /// Returns `true` if `node` is the base of a live allocation.
    #[inline]
    fn is_allocation(&self, node: usize, level: u32) -> bool {
        !self.tree.get(node)
            && (level == self.depth || (self.tree.get(2 * node) && self.tree.get(2 * node + 1)))
    }

    /// Returns the byte offset of the first block covered by `node`.
    #[inline]
    fn offset_of(&self, node: usize, level: u32) -> usize {
        ((node << (self.depth - level)) - self.num_blocks()) * self.block_size
    }

    /// Finds the leftmost free node at level `target` in the subtree rooted at
    /// `node`.
    fn find_free(&self, node: usize, level: u32, target: u32) -> Option<usize> {
        if self.tree.get(node) {
            // The whole subtree is free.
            return Some(node << (target - level));
        }

        if level == target || self.is_allocation(node, level) {
            return None;
        }

        self.find_free(2 * node, level + 1, target)
            .or_else(|| self.find_free(2 * node + 1, level + 1, target))
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// The size is rounded up to a power-of-two number of blocks. The
    /// returned pointer is aligned to the block size relative to the start of
    /// the page, and the contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is zero.
    /// - [`Error::OutOfMemory`] if `size` exceeds the page or no free run of
    ///   blocks is large enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }

        let level = self.level_for(size).ok_or(Error::OutOfMemory)?;
        let node = self
            .find_free(ROOT, 0, level)
            .ok_or(Error::OutOfMemory)?;

        let ptr = self
            .base
            .with_offset(self.offset_of(node, level))
            .ok_or(Error::OutOfMemory)?;

        self.tree.set(node, false);

        // Every ancestor is now split; stop at the first one that already was.
        let mut ancestor = node / 2;
        while ancestor >= ROOT && self.tree.get(ancestor) {
            self.tree.set(ancestor, false);
            ancestor /= 2;
        }

        self.allocated += pow2(self.depth - level);

        log::trace!(
            "buddy {:#x}: allocated {} bytes at node {} (level {})",
            self.base.addr().get(),
            size,
            node,
            level
        );

        Ok(ptr)
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPointer`] if `ptr` lies outside the page, is
    /// not the base address of a live allocation, or was already freed. The
    /// allocator is unchanged on error.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        let ofs = self
            .base
            .offset_to(ptr.addr())
            .ok_or(Error::InvalidPointer)?;

        if ofs % self.block_size != 0 {
            return Err(Error::InvalidPointer);
        }

        // Climb from the leaf through the free-marked interior of the
        // allocation to the node that was actually allocated.
        let mut node = self.num_blocks() + ofs / self.block_size;
        while self.tree.get(node) {
            node /= 2;
            if node < ROOT {
                return Err(Error::InvalidPointer);
            }
        }

        let level = log2(node);
        if !self.is_allocation(node, level) || self.offset_of(node, level) != ofs {
            log::debug!(
                "buddy {:#x}: rejected free of {:p}",
                self.base.addr().get(),
                ptr
            );
            return Err(Error::InvalidPointer);
        }

        // The subtree below `node` was never cleared, so setting `node`
        // frees the whole run. Merge upward while the buddy is also free.
        self.tree.set(node, true);

        let mut merged = node;
        while merged > ROOT && self.tree.get(merged ^ 1) {
            merged /= 2;
            self.tree.set(merged, true);
        }

        self.allocated -= pow2(self.depth - level);

        log::trace!(
            "buddy {:#x}: freed node {} (level {})",
            self.base.addr().get(),
            node,
            level
        );

        Ok(())
    }

    /// Counts the blocks covered by allocations in the subtree rooted at
    /// `node`.
    fn used_blocks(&self, node: usize, level: u32) -> usize {
        if self.tree.get(node) {
            0
        } else if self.is_allocation(node, level) {
            pow2(self.depth - level)
        } else {
            self.used_blocks(2 * node, level + 1) + self.used_blocks(2 * node + 1, level + 1)
        }
    }

    /// Returns usage statistics computed by walking the tree.
    pub fn stat(&self) -> BuddyStats {
        let n_blocks_used = self.used_blocks(ROOT, 0);

        BuddyStats {
            size: self.capacity(),
            used: n_blocks_used * self.block_size,
            n_blocks: self.num_blocks(),
            n_blocks_used,
        }
    }

    /// Returns the number of allocated bytes, computed by walking the tree.
    pub fn size(&self) -> usize {
        self.used_blocks(ROOT, 0) * self.block_size
    }
}

impl fmt::Debug for Buddy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.base.ptr())
            .field("page_size", &self.capacity())
            .field("block_size", &self.block_size)
            .field("allocated_blocks", &self.allocated)
            .finish()
    }
}
