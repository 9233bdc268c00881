//! Integration tests for parallel operations on a real thread pool.
//!
//! These tests are ignored under Miri because Miri is too slow for real worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use new_zealand::nz;
use par_batch::{
    CountdownLatch, Error, ErrorKind, ExecutionEngine, LatchKind, ParallelOptions, ThreadPool,
    Timeout, WorkerLimits, WorkerPool,
};
use testing::{ConcurrencyProbe, assert_waited, timed, with_watchdog};

#[cfg_attr(miri, ignore)]
#[test]
fn ten_items_one_failure_all_items_complete() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();
        let completed = Arc::new(AtomicUsize::new(0));

        let error = engine
            .parallel_for_each(
                0..10_u32,
                &ParallelOptions::new().with_partition_size(nz!(3)),
                {
                    let completed = Arc::clone(&completed);

                    move |i| {
                        completed.fetch_add(1, Ordering::SeqCst);

                        if i == 5 {
                            return Err(format!("item {i} failed").into());
                        }

                        Ok(())
                    }
                },
            )
            .unwrap_err();

        assert_eq!(completed.load(Ordering::SeqCst), 10);

        let Error::Aggregated(aggregated) = error else {
            panic!("expected aggregated failure, got {error:?}");
        };

        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated.causes()[0].sort_key(), 5);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn many_concurrent_failures_are_all_reported() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();

        let error = engine
            .parallel_for(
                0,
                64,
                1,
                &ParallelOptions::new().with_partition_size(nz!(16)),
                |i| {
                    if i % 2 == 1 {
                        return Err("odd".into());
                    }

                    Ok(())
                },
            )
            .unwrap_err();

        let Error::Aggregated(aggregated) = error else {
            panic!("expected aggregated failure, got {error:?}");
        };

        let keys = aggregated
            .causes()
            .iter()
            .map(|failure| failure.sort_key())
            .collect::<Vec<_>>();
        let expected = (0..64).filter(|k| k % 2 == 1).collect::<Vec<u64>>();

        assert_eq!(keys, expected);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn lazy_source_is_consumed_in_order() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();

        let mut next = 0_usize;
        let source = std::iter::from_fn(move || {
            let current = next;
            next += 1;
            (current < 25).then_some(current)
        });

        let results = engine
            .parallel_for_each_with_result(
                source,
                &ParallelOptions::new().with_partition_size(nz!(4)),
                |n| Ok(n.to_string()),
            )
            .unwrap();

        let expected = (0..25).map(|n: usize| n.to_string()).collect::<Vec<_>>();
        assert_eq!(results, expected);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn partitions_never_overlap() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();
        let probe = ConcurrencyProbe::new();

        for latch_kind in [LatchKind::Event, LatchKind::Spin] {
            engine
                .parallel_for(
                    0,
                    30,
                    1,
                    &ParallelOptions::new()
                        .with_partition_size(nz!(5))
                        .with_latch_kind(latch_kind),
                    {
                        let probe = probe.clone();

                        move |_| {
                            let _inside = probe.enter();
                            thread::sleep(Duration::from_millis(1));
                            Ok(())
                        }
                    },
                )
                .unwrap();
        }

        assert_eq!(probe.entered(), 60);
        assert!(probe.peak() <= 5);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn countdown_step_visits_expected_indexes() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();

        let visited = engine
            .parallel_for_with_result(10, 0, -3, &ParallelOptions::default(), Ok)
            .unwrap();

        assert_eq!(visited, [10, 7, 4, 1]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn slow_partition_times_out() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();
        let limit = Duration::from_millis(50);

        let (result, elapsed) = timed(|| {
            engine.parallel_for_each(
                0..2_u32,
                &ParallelOptions::new().with_timeout(limit),
                |_| {
                    thread::sleep(Duration::from_millis(500));
                    Ok(())
                },
            )
        });

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_waited(elapsed, limit);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn timeout_reports_failures_from_before_it() {
    with_watchdog(|| {
        let engine = ExecutionEngine::new();

        let error = engine
            .parallel_for_each(
                0..3_u32,
                &ParallelOptions::new()
                    .with_partition_size(nz!(1))
                    .with_timeout(Duration::from_millis(50)),
                |i| match i {
                    0 => Err("first item failed".into()),
                    1 => {
                        thread::sleep(Duration::from_millis(500));
                        Ok(())
                    }
                    _ => Ok(()),
                },
            )
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Timeout);

        let Error::PartitionTimeout {
            partition,
            failures: Some(failures),
            ..
        } = error
        else {
            panic!("expected partition timeout with failures, got {error:?}");
        };

        assert_eq!(partition, 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.causes()[0].sort_key(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shared_pool_serves_several_engines() {
    with_watchdog(|| {
        let pool = Arc::new(
            ThreadPool::builder()
                .worker_limits(WorkerLimits::new(0, nz!(4)).unwrap())
                .thread_name_prefix("shared")
                .build(),
        );

        let first = ExecutionEngine::with_pool(Arc::clone(&pool));
        let second = ExecutionEngine::with_pool(Arc::clone(&pool));

        let names = first
            .parallel_for_with_result(
                0,
                4,
                1,
                &ParallelOptions::new().with_tune_pool(false),
                |_| Ok(thread::current().name().map(str::to_string)),
            )
            .unwrap();

        for name in names {
            let name = name.unwrap();
            assert!(name.starts_with("shared-"), "unexpected thread name {name}");
        }

        let sum = second
            .parallel_for_with_result(1, 5, 1, &ParallelOptions::default(), Ok)
            .unwrap()
            .into_iter()
            .sum::<i64>();

        assert_eq!(sum, 10);
        assert_eq!(
            pool.worker_limits(),
            WorkerLimits::new(0, nz!(4)).unwrap()
        );
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_signals_report_set_once() {
    with_watchdog(|| {
        const SIGNALLERS: usize = 32;

        for latch_kind in [LatchKind::Event, LatchKind::Spin] {
            let latch = latch_kind.create(SIGNALLERS);
            let transitions = Arc::new(AtomicUsize::new(0));

            let handles = (0..SIGNALLERS)
                .map(|_| {
                    let latch = Arc::clone(&latch);
                    let transitions = Arc::clone(&transitions);

                    thread::spawn(move || {
                        if latch.signal().unwrap() {
                            transitions.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect::<Vec<_>>();

            latch.wait(Timeout::Infinite).unwrap();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(transitions.load(Ordering::SeqCst), 1);
            assert!(latch.signal().is_err());
        }
    });
}
