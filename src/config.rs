use core::mem;

use crate::{bits::log2, Error};

/// The geometry of a pool.
///
/// A pool of `pool_size` bytes is divided into `pool_size / page_size`
/// pages, each of which is divided into `page_size / block_size` blocks.
///
/// A configuration is valid when:
/// - `block_size` and `page_size` are nonzero powers of two,
/// - `page_size` is at least `block_size`, and
/// - `pool_size` is a nonzero multiple of `page_size`.
///
/// The default configuration describes a 4 MiB pool of 4 KiB pages with
/// 8-byte blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolConfig {
    /// Total size of the managed region, in bytes.
    pub pool_size: usize,
    /// Size of one page, in bytes.
    pub page_size: usize,
    /// Size of the smallest allocatable block, in bytes.
    pub block_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::new(4 * 1024 * 1024, 4 * 1024, 8)
    }
}

impl PoolConfig {
    /// Creates a configuration. The result is not validated until it is used
    /// to construct an allocator, or [`validate`](Self::validate) is called.
    pub const fn new(pool_size: usize, page_size: usize, block_size: usize) -> PoolConfig {
        PoolConfig {
            pool_size,
            page_size,
            block_size,
        }
    }

    /// Checks the configuration rules.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if the page or block size is zero or not a
    ///   power of two, or if the page is smaller than a block.
    /// - [`Error::InvalidPool`] if the pool size is not a nonzero multiple
    ///   of the page size.
    pub fn validate(&self) -> Result<(), Error> {
        validate_page(self.page_size, self.block_size)?;

        if self.pool_size == 0 || self.pool_size % self.page_size != 0 {
            return Err(Error::InvalidPool);
        }

        Ok(())
    }

    /// Returns the number of pages in the pool.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.pool_size / self.page_size
    }

    /// Returns the number of blocks in one page.
    #[inline]
    pub fn blocks_per_page(&self) -> usize {
        self.page_size / self.block_size
    }

    /// Returns the depth of a page's buddy tree, i.e. the level of its
    /// leaves.
    #[inline]
    pub fn depth(&self) -> u32 {
        log2(self.blocks_per_page())
    }

    /// Returns the size of the header stored in front of allocations that
    /// span multiple pages.
    ///
    /// The header holds the span's page count. It occupies at least one
    /// block so that the address following it stays block-aligned.
    #[inline]
    pub fn header_size(&self) -> usize {
        mem::size_of::<usize>().max(self.block_size)
    }
}

/// Checks the page and block sizes of a single buddy-managed page.
pub(crate) fn validate_page(page_size: usize, block_size: usize) -> Result<(), Error> {
    if !block_size.is_power_of_two() || !page_size.is_power_of_two() || page_size < block_size {
        return Err(Error::InvalidSize);
    }

    Ok(())
}
