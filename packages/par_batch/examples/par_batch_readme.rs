//! Basic use of the parallel loops.

use new_zealand::nz;
use par_batch::{ExecutionEngine, ParallelOptions};

fn main() {
    let engine = ExecutionEngine::new();

    // At most 8 bodies run at the same time.
    let options = ParallelOptions::new().with_partition_size(nz!(8));

    let lengths = engine
        .parallel_for_each_with_result(
            ["alpha", "beta", "gamma", "delta"],
            &options,
            |word: &str| Ok(word.len()),
        )
        .unwrap();

    assert_eq!(lengths, [5, 4, 5, 5]);

    engine
        .parallel_for(0, 100, 10, &options, |i| {
            println!("processing {i}");
            Ok(())
        })
        .unwrap();
}
