#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use pool_alloc::PoolConfig;
use pool_alloc_hater::SlabSubject;

const MAX_NUM_PAGES: usize = 64;
const MAX_BLOCK_SHIFT: u8 = 6;
const MAX_BLOCKS_SHIFT: u8 = 10;

#[derive(Clone, Debug)]
struct Args {
    config: PoolConfig,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let block_size = 1 << (u8::arbitrary(un)? % (MAX_BLOCK_SHIFT + 1));
        let page_size = block_size << (u8::arbitrary(un)? % (MAX_BLOCKS_SHIFT + 1));
        let num_pages = 1 + usize::arbitrary(un)? % MAX_NUM_PAGES;
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            config: PoolConfig::new(num_pages * page_size, page_size, block_size),
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args { config, ops } = args;

    let slab = match SlabSubject::new(config) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(slab);
    eval.evaluate(ops).unwrap();
});
