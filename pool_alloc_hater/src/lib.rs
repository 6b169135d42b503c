#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use pool_alloc::{Buddy, Error, Global, Pool, PoolConfig, Slab};

/// A single-page buddy allocator over heap-allocated storage.
pub struct BuddySubject {
    buddy: Buddy,
    _tree: Vec<u8>,
    _region: Vec<u64>,
}

impl BuddySubject {
    pub fn new(page_size: usize, block_size: usize) -> Result<Self, Error> {
        let layout = Buddy::tree_layout(page_size, block_size)?;
        let mut tree = vec![0u8; layout.size()];
        let mut region = vec![0u64; page_size.div_ceil(8)];

        let tree_ptr = NonNull::new(tree.as_mut_ptr()).ok_or(Error::InvalidPool)?;
        let region_ptr = NonNull::new(region.as_mut_ptr().cast()).ok_or(Error::InvalidPool)?;

        // SAFETY: both vectors are large enough and are owned by the subject
        // for as long as the buddy exists.
        let buddy = unsafe { Buddy::new_raw(tree_ptr, region_ptr, page_size, block_size)? };

        Ok(BuddySubject {
            buddy,
            _tree: tree,
            _region: region,
        })
    }
}

impl Subject for BuddySubject {
    type Op = ();
    type Error = Error;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::Error> {
        self.buddy.allocate(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::Error> {
        self.buddy.deallocate(ptr)
    }

    fn used(&self) -> usize {
        self.buddy.allocated_bytes()
    }

    fn reset(&mut self) {
        self.buddy.init();
    }

    fn handle_custom_op(&mut self, (): ()) {}
}

pub struct SlabSubject(Slab<Global>);

impl SlabSubject {
    pub fn new(config: PoolConfig) -> Result<Self, Error> {
        let s = Slab::try_new(config)?;
        Ok(SlabSubject(s))
    }
}

impl Subject for SlabSubject {
    type Op = ();
    type Error = Error;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::Error> {
        self.0.allocate(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::Error> {
        self.0.deallocate(ptr)
    }

    fn used(&self) -> usize {
        self.0.size()
    }

    fn reset(&mut self) {
        self.0.init();
    }

    fn handle_custom_op(&mut self, (): ()) {}
}

pub struct PoolSubject(Pool<Global>);

impl PoolSubject {
    pub fn new(config: PoolConfig) -> Result<Self, Error> {
        let p = Pool::try_new(config)?;
        Ok(PoolSubject(p))
    }
}

impl Subject for PoolSubject {
    type Op = ();
    type Error = Error;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::Error> {
        self.0.malloc(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::Error> {
        self.0.free(ptr)
    }

    fn used(&self) -> usize {
        self.0.stat().used
    }

    fn reset(&mut self) {
        self.0.init();
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};

    use super::*;

    fn ops() -> Vec<AllocatorOp> {
        use AllocatorOp::*;

        vec![
            Alloc(4),
            Alloc(4),
            Dealloc(0),
            Alloc(8),
            Alloc(0),
            Alloc(300),
            Alloc(700),
            Dealloc(7),
            Alloc(2000),
            Alloc(100_000),
            Reset,
            Alloc(512),
            Alloc(1),
            Dealloc(1),
        ]
    }

    #[test]
    fn buddy_survives_evaluation() {
        let subject = BuddySubject::new(512, 4).unwrap();
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }

    #[test]
    fn slab_survives_evaluation() {
        let subject = SlabSubject::new(PoolConfig::new(4096, 512, 4)).unwrap();
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }

    #[test]
    fn pool_survives_evaluation() {
        let subject = PoolSubject::new(PoolConfig::default()).unwrap();
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }
}
