#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use pool_alloc_hater::BuddySubject;

const MAX_BLOCK_SHIFT: u8 = 6;
const MAX_BLOCKS_SHIFT: u8 = 12;

#[derive(Clone, Debug)]
struct Args {
    page_size: usize,
    block_size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let block_size = 1 << (u8::arbitrary(un)? % (MAX_BLOCK_SHIFT + 1));
        let page_size = block_size << (u8::arbitrary(un)? % (MAX_BLOCKS_SHIFT + 1));
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            page_size,
            block_size,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let buddy = match BuddySubject::new(args.page_size, args.block_size) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(buddy);
    eval.evaluate(args.ops).unwrap();
});
