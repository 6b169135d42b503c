#![cfg(test)]
extern crate std;

use core::{fmt::Debug, marker::PhantomData, ptr::NonNull, slice};

use crate::{bits::round_up_pow2, Buddy, Error, Global, PageState, Pool, PoolConfig, Slab};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, Error>;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error>;

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error>;

    /// Returns the start and length of the managed region.
    fn region(&self) -> (NonNull<u8>, usize);

    fn block_size(&self) -> usize;

    /// Returns the number of bytes charged for a successful allocation of
    /// `size` bytes.
    fn charge(&self, size: usize) -> usize;

    /// Returns the number of allocated bytes reported by the allocator.
    fn used(&self) -> usize;

    /// Checks the allocator's bookkeeping.
    fn is_consistent(&self) -> bool;
}

fn buddy_charge(size: usize, block_size: usize) -> usize {
    round_up_pow2(size.div_ceil(block_size)).unwrap_or(0) * block_size
}

fn slab_charge(config: &PoolConfig, size: usize) -> usize {
    if size > config.page_size {
        (size + config.header_size()).div_ceil(config.page_size) * config.page_size
    } else {
        buddy_charge(size, config.block_size)
    }
}

fn slab_is_consistent<A: crate::BackingAllocator>(slab: &Slab<A>) -> bool {
    let stats = slab.stat();
    let mut counts = [0usize; 4];

    for page in 0..stats.n_pages {
        let (state, buddy) = match (slab.page_state(page), slab.buddy(page)) {
            (Some(s), Some(b)) => (s, b),
            _ => return false,
        };

        counts[state as usize] += 1;

        let agrees = match state {
            PageState::Empty | PageState::Raw => buddy.is_empty(),
            PageState::Partial => !buddy.is_empty() && !buddy.is_full(),
            PageState::Full => buddy.is_full(),
        };

        if !agrees || buddy.allocated_bytes() != buddy.size() {
            return false;
        }
    }

    counts
        == [
            stats.n_pages_empty,
            stats.n_pages_partial,
            stats.n_pages_full,
            stats.n_pages_raw,
        ]
        && stats.used == slab.size()
        && slab.page_state(stats.n_pages).is_none()
}

// Config =====================================================================

#[derive(Clone, Debug)]
struct ConfigParams {
    config: PoolConfig,
}

impl Arbitrary for ConfigParams {
    fn arbitrary(g: &mut Gen) -> Self {
        let block_size = 1 << (u8::arbitrary(g) % 5);
        let page_size = block_size << (u8::arbitrary(g) % 8);
        let num_pages = 1 + usize::arbitrary(g) % 16;

        ConfigParams {
            config: PoolConfig::new(num_pages * page_size, page_size, block_size),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let config = self.config;
        let num_pages = config.num_pages();

        Box::new((1..num_pages).rev().map(move |n| ConfigParams {
            config: PoolConfig::new(n * config.page_size, config.page_size, config.block_size),
        }))
    }
}

// Slab =======================================================================

impl QcAllocator for Slab<Global> {
    type Params = ConfigParams;

    fn with_params(params: Self::Params) -> Result<Self, Error> {
        Slab::try_new(params.config)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        self.allocate(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.deallocate(ptr)
    }

    fn region(&self) -> (NonNull<u8>, usize) {
        (self.region(), self.config().pool_size)
    }

    fn block_size(&self) -> usize {
        self.config().block_size
    }

    fn charge(&self, size: usize) -> usize {
        slab_charge(self.config(), size)
    }

    fn used(&self) -> usize {
        self.stat().used
    }

    fn is_consistent(&self) -> bool {
        slab_is_consistent(self)
    }
}

// Pool =======================================================================

impl QcAllocator for Pool<Global> {
    type Params = ConfigParams;

    fn with_params(params: Self::Params) -> Result<Self, Error> {
        Pool::try_new(params.config)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        self.malloc(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.free(ptr)
    }

    fn region(&self) -> (NonNull<u8>, usize) {
        let slab = self.as_slab();
        (slab.region(), slab.config().pool_size)
    }

    fn block_size(&self) -> usize {
        self.as_slab().config().block_size
    }

    fn charge(&self, size: usize) -> usize {
        slab_charge(self.as_slab().config(), size)
    }

    fn used(&self) -> usize {
        self.size()
    }

    fn is_consistent(&self) -> bool {
        slab_is_consistent(self.as_slab()) && self.stat() == self.as_slab().stat()
    }
}

// Buddy ======================================================================

/// A `Buddy` over heap-allocated storage.
struct OwnedBuddy {
    buddy: Buddy,
    _tree: Vec<u8>,
    _region: Vec<u64>,
}

impl QcAllocator for OwnedBuddy {
    type Params = ConfigParams;

    fn with_params(params: Self::Params) -> Result<Self, Error> {
        let PoolConfig {
            page_size,
            block_size,
            ..
        } = params.config;

        let layout = Buddy::tree_layout(page_size, block_size)?;
        let mut tree = std::vec![0u8; layout.size()];
        let mut region = std::vec![0u64; page_size.div_ceil(8)];

        let buddy = unsafe {
            Buddy::new_raw(
                NonNull::new(tree.as_mut_ptr()).unwrap(),
                NonNull::new(region.as_mut_ptr().cast()).unwrap(),
                page_size,
                block_size,
            )?
        };

        Ok(OwnedBuddy {
            buddy,
            _tree: tree,
            _region: region,
        })
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        self.buddy.allocate(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.buddy.deallocate(ptr)
    }

    fn region(&self) -> (NonNull<u8>, usize) {
        (self.buddy.region(), self.buddy.capacity())
    }

    fn block_size(&self) -> usize {
        self.buddy.block_size()
    }

    fn charge(&self, size: usize) -> usize {
        buddy_charge(size, self.buddy.block_size())
    }

    fn used(&self) -> usize {
        self.buddy.allocated_bytes()
    }

    fn is_consistent(&self) -> bool {
        let stats = self.buddy.stat();

        stats.used == self.buddy.allocated_bytes()
            && stats.n_blocks_used == self.buddy.allocated_blocks()
            && stats.n_blocks_used <= stats.n_blocks
    }
}

// Operations =================================================================

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp<P: Arbitrary> {
    /// Allocate a buffer described by `params`.
    Allocate { params: P },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl<P: Arbitrary> Arbitrary for AllocatorOp<P> {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                params: P::arbitrary(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

struct RawAllocation {
    id: OpId,
    ptr: NonNull<u8>,
    size: usize,
}

type AllocResult = Result<NonNull<u8>, Error>;

trait PropAllocation {
    type Params: Arbitrary;

    fn size(params: &Self::Params) -> usize;
    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self;
    fn into_raw(self) -> RawAllocation;
}

trait Prop {
    /// The allocator to test for this property.
    type Allocator: QcAllocator;

    type Allocation: PropAllocation;

    /// Examines the result of an allocation.
    fn post_allocate(
        op_id: OpId,
        params: &<Self::Allocation as PropAllocation>::Params,
        res: &mut AllocResult,
    ) -> bool {
        let _ = (op_id, params, res);
        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        let _ = allocation;
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<P::Allocation>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcAllocator>::Params,
        capacity: usize,
    ) -> Result<Self, Error> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    /// Returns `true` if an allocation of `size` bytes at `ptr` lies inside
    /// the managed region and is block-aligned relative to its start.
    fn in_bounds(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let (base, len) = self.allocator.region();
        let base = base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;

        addr >= base
            && (addr - base) % self.allocator.block_size() == 0
            && (addr - base)
                .checked_add(size)
                .map_or(false, |end| end <= len)
    }

    fn do_op(&mut self, op: AllocatorOp<<P::Allocation as PropAllocation>::Params>) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { params } => {
                let size = P::Allocation::size(&params);
                let used = self.allocator.used();
                let mut res = self.allocator.allocate(size);

                if !P::post_allocate(op_id, &params, &mut res) {
                    return false;
                }

                match res {
                    Ok(ptr) => {
                        if !self.in_bounds(ptr, size)
                            || self.allocator.used() != used + self.allocator.charge(size)
                        {
                            return false;
                        }

                        self.allocations.push(P::Allocation::from_raw(
                            &params,
                            RawAllocation {
                                id: op_id,
                                ptr,
                                size,
                            },
                        ));
                    }

                    Err(Error::InvalidSize) if size == 0 => (),

                    // Failed allocations leave the allocator unchanged.
                    Err(Error::OutOfMemory) if size != 0 => {
                        if self.allocator.used() != used {
                            return false;
                        }
                    }

                    Err(_) => return false,
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_deallocate(&a) {
                    return false;
                }

                let a = a.into_raw();
                let remaining = self.allocator.used() - self.allocator.charge(a.size);

                if self.allocator.deallocate(a.ptr).is_err() || self.allocator.used() != remaining
                {
                    return false;
                }

                // A second free is rejected without effect.
                if self.allocator.deallocate(a.ptr) != Err(Error::InvalidPointer)
                    || self.allocator.used() != remaining
                {
                    return false;
                }
            }
        }

        self.allocator.is_consistent()
    }

    fn run(&mut self, ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for alloc in self.allocations.drain(..) {
            let alloc = alloc.into_raw();
            if self.allocator.deallocate(alloc.ptr).is_err() {
                return false;
            }
        }

        self.allocator.used() == 0 && self.allocator.is_consistent()
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

struct MutuallyExclusiveAllocation {
    op_id: OpId,
    ptr: NonNull<u8>,
    size: usize,
}

impl MutuallyExclusiveAllocation {
    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

#[derive(Clone, Debug)]
struct MutuallyExclusiveAllocationParams {
    size: usize,
}

impl Arbitrary for MutuallyExclusiveAllocationParams {
    fn arbitrary(g: &mut Gen) -> Self {
        MutuallyExclusiveAllocationParams {
            size: limited_size(g),
        }
    }
}

impl PropAllocation for MutuallyExclusiveAllocation {
    type Params = MutuallyExclusiveAllocationParams;

    fn size(params: &Self::Params) -> usize {
        params.size
    }

    fn from_raw(_: &Self::Params, raw: RawAllocation) -> Self {
        MutuallyExclusiveAllocation {
            op_id: raw.id,
            ptr: raw.ptr,
            size: raw.size,
        }
    }

    fn into_raw(self) -> RawAllocation {
        RawAllocation {
            id: self.op_id,
            ptr: self.ptr,
            size: self.size,
        }
    }
}

fn paint_byte(op_id: OpId, i: usize) -> u8 {
    op_id.to_le_bytes()[i % 4]
}

impl<A: QcAllocator> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    type Allocation = MutuallyExclusiveAllocation;

    fn post_allocate(
        op_id: OpId,
        params: &MutuallyExclusiveAllocationParams,
        res: &mut AllocResult,
    ) -> bool {
        if let Ok(ptr) = res {
            let bytes = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), params.size) };
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = paint_byte(op_id, i);
            }
        }

        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        allocation
            .bytes()
            .iter()
            .enumerate()
            .all(|(i, &byte)| byte == paint_byte(allocation.op_id, i))
    }
}

fn check<P: Prop>(
    params: <P::Allocator as QcAllocator>::Params,
    ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>,
) -> bool {
    let mut checker: AllocatorChecker<P> = AllocatorChecker::new(params, ops.capacity()).unwrap();
    checker.run(ops)
}

#[test]
fn slab_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<Slab<Global>>> as fn(_, _) -> bool);
}

#[test]
fn pool_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<Pool<Global>>> as fn(_, _) -> bool);
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<OwnedBuddy>> as fn(_, _) -> bool);
}

// Re-initialization ==========================================================

fn reinit_matches_fresh(params: ConfigParams, sizes: Vec<MutuallyExclusiveAllocationParams>) -> bool {
    let mut used = Slab::try_new(params.config).unwrap();
    let mut fresh = Slab::try_new(params.config).unwrap();

    for p in &sizes {
        let _ = used.allocate(p.size);
    }
    used.init();

    let stats = used.stat();
    if stats.used != 0 || stats.n_pages_empty != stats.n_pages {
        return false;
    }

    sizes.iter().all(|p| {
        let offset = |slab: &Slab<Global>, res: Result<NonNull<u8>, Error>| {
            res.map(|ptr| ptr.as_ptr() as usize - slab.region().as_ptr() as usize)
        };

        let a = used.allocate(p.size);
        let b = fresh.allocate(p.size);
        offset(&used, a) == offset(&fresh, b)
    }) && used.stat() == fresh.stat()
}

#[test]
fn slab_reinit_matches_fresh() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(reinit_matches_fresh as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
