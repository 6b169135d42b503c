//! A small library for ~~hating on~~ evaluating the correctness of pool
//! allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of
//! [`AllocatorOp`]s, painting every allocation with the ID of the operation
//! that made it and verifying the paint before the allocation is freed.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on generated allocation sizes, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 16;

/// An allocation size which implements `Arbitrary`.
///
/// Sizes are distributed roughly evenly across orders of magnitude, and
/// include zero.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and use it to bound the size.
        let exp = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << exp);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Reset,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate the given number of bytes.
    Alloc(usize),
    /// Free an outstanding allocation. Given `n` outstanding allocations, the
    /// allocation at index `idx % n` is freed.
    Dealloc(usize),
    /// Reset the subject, forgetting every outstanding allocation.
    Reset,
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Reset => AllocatorOp::Reset,
        };

        Ok(op)
    }
}

pub trait Subject {
    type Op: for<'a> arbitrary::Arbitrary<'a>;
    type Error: core::fmt::Debug;

    /// Allocates `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::Error>;

    /// Deallocates the block of memory pointed to by `ptr`.
    ///
    /// The subject must reject pointers it did not hand out, so this is safe
    /// to call with any pointer.
    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::Error>;

    /// Returns the number of bytes the subject reports as allocated.
    fn used(&self) -> usize;

    /// Forgets every outstanding allocation.
    fn reset(&mut self);

    fn handle_custom_op(&mut self, op: Self::Op) {
        // To silence the unused variable warning.
        drop(op);
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<u8>,
    // The requested size.
    size: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `size` bytes.
    /// - No references to the memory at `ptr` may exist when this function is
    ///   called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<u8>, size: usize, id: u64) -> Block {
        let mut b = Block { ptr, size, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a slice of uninitialized bytes.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<u8>] {
        // SAFETY: self is immutably borrowed, so only immutable references to
        // the slice can exist
        unsafe { slice::from_raw_parts(self.ptr.cast().as_ptr(), self.size) }
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice::from_raw_parts_mut(self.ptr.cast().as_ptr(), self.size) }
    }

    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.ptr, self.size)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: every byte was initialized by `paint`.
        let slice: &[u8] = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            let ok = match op {
                AllocatorOp::Alloc(size) => match self.subject.allocate(size) {
                    Ok(ptr) => {
                        let block = unsafe { Block::init(ptr, size, op_id) };
                        blocks.push(block);
                        size != 0
                    }
                    Err(_) => true,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(mut block) => {
                        let verified = block.verify();
                        block.paint(op_id);

                        let (ptr, _) = block.into_raw_parts();
                        let used = self.subject.used();

                        verified
                            && self.subject.deallocate(ptr).is_ok()
                            && self.subject.used() < used
                            // A double free must be rejected.
                            && self.subject.deallocate(ptr).is_err()
                    }
                    None => true,
                },

                AllocatorOp::Reset => {
                    blocks.clear();
                    self.subject.reset();
                    self.subject.used() == 0
                }
            };

            if !ok {
                return Err(Failed {
                    completed,
                    failed_op: op,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            let verified = block.verify();
            let (ptr, size) = block.into_raw_parts();

            if !verified || self.subject.deallocate(ptr).is_err() {
                return Err(Failed {
                    completed,
                    failed_op: AllocatorOp::Alloc(size),
                });
            }
        }

        if self.subject.used() != 0 {
            return Err(Failed {
                completed,
                failed_op: AllocatorOp::Reset,
            });
        }

        Ok(())
    }
}
