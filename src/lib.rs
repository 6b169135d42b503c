//! A fixed-capacity page/block pool allocator.
//!
//! The allocators in this crate manage memory supplied by the caller and
//! never touch a system heap on their own. A [`Slab`] splits its managed
//! region into equally-sized pages; each page is subdivided by a [`Buddy`]
//! allocator into power-of-two runs of blocks. Requests larger than a page
//! bypass the buddy layer and reserve a contiguous span of whole pages.
//!
//! [`Pool`] is the public face of the slab, using the familiar
//! `init`/`malloc`/`free` vocabulary.
//!
//! ## Memory
//!
//! Every allocator is constructed over two regions:
//!
//! - the *managed region*, which is handed out to callers, and
//! - the *metadata region*, which holds all of the allocator's bookkeeping
//!   (bitmaps, buddy headers and page states).
//!
//! The layouts of both regions are computed from a [`PoolConfig`]. With the
//! `alloc` feature enabled, both regions may instead be obtained from the
//! global allocator.
//!
//! ## Concurrency
//!
//! None of the allocators are `Send` or `Sync`. Callers that need to share a
//! pool between threads must serialize access to it themselves, e.g. by
//! placing the whole pool behind a single mutex.

#![doc(html_root_url = "https://docs.rs/pool_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bits;
pub mod buddy;
mod config;
mod polyfill;
pub mod pool;
pub mod slab;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    bits::{log2, pow2, LOG2_UNDEFINED},
    buddy::{Buddy, BuddyStats},
    config::PoolConfig,
    pool::{Pool, PoolStats},
    slab::{PageState, Slab, SlabStats},
};

/// The error type shared by every allocator operation.
///
/// A successful operation is represented by `Ok(_)`; each variant describes
/// one class of failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// No suitable free memory was available.
    ///
    /// This is an ordinary, recoverable condition; the allocator is left
    /// unchanged.
    OutOfMemory,

    /// The pool configuration or its backing memory is invalid.
    ///
    /// Returned when the pool size is not a nonzero multiple of the page
    /// size, or when the configured regions cannot be represented.
    InvalidPool,

    /// The pointer was not returned by this allocator, was already freed,
    /// or is not the base of its allocation.
    InvalidPointer,

    /// The requested size is invalid.
    ///
    /// Returned for zero-sized requests and for page or block sizes that
    /// violate the configuration rules.
    InvalidSize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::OutOfMemory => "out of memory",
            Error::InvalidPool => "invalid pool configuration",
            Error::InvalidPointer => "invalid pointer",
            Error::InvalidSize => "invalid size",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
#[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
impl std::error::Error for Error {}

/// Types which provide memory which backs an allocator.
///
/// This trait is sealed, and is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by
///   another allocator. This is the case when constructing the allocator
///   from raw pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
