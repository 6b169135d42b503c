#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use pool_alloc::PoolConfig;
use pool_alloc_hater::PoolSubject;

#[derive(Clone, Debug)]
struct Args {
    pool_size: usize,
    page_size: usize,
    block_size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        // Unconstrained geometry, so that invalid configurations are
        // exercised too.
        let pool_size = usize::arbitrary(un)? % (1 << 16);
        let page_size = usize::arbitrary(un)? % (1 << 14);
        let block_size = usize::arbitrary(un)? % (1 << 8);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            pool_size,
            page_size,
            block_size,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let config = PoolConfig::new(args.pool_size, args.page_size, args.block_size);

    let pool = match PoolSubject::new(config) {
        Ok(p) => p,
        Err(_) => {
            assert!(config.validate().is_err());
            return;
        }
    };

    let mut eval = alloc_hater::Evaluator::new(pool);
    eval.evaluate(args.ops).unwrap();
});
