//! Shows how failures from many work items are reported together.

use std::io;

use new_zealand::nz;
use par_batch::{Error, ExecutionEngine, ParallelOptions};

fn main() {
    let engine = ExecutionEngine::new();
    let options = ParallelOptions::new().with_partition_size(nz!(4));

    let result = engine.parallel_for_each(1..=12_u32, &options, |n| {
        if n % 5 == 0 {
            return Err(io::Error::other(format!("{n} is a multiple of five")).into());
        }

        if n == 7 {
            panic!("seven is unlucky");
        }

        Ok(())
    });

    match result {
        Err(Error::Aggregated(failures)) => {
            println!("{failures}");

            for failure in failures.causes() {
                println!("  item {}: {}", failure.sort_key(), failure.cause());
            }
        }
        other => println!("unexpected outcome: {other:?}"),
    }
}
