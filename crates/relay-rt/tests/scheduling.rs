// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end behavior shared by both schedulers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relay_rt::{
    any_of, fold_async, lift, zip, BreakerOptions, BreakerState, CircuitBreaker, CompletionCell,
    RejectReason, TaskError, TaskScheduler, TimeoutEnforcingPool, WorkQueue, WorkStealingPool,
};

const LONG: Duration = Duration::from_secs(10);

fn stealing(workers: usize) -> Arc<WorkStealingPool> {
    Arc::new(
        WorkStealingPool::builder()
            .workers(workers)
            .idle_recheck(Duration::from_millis(5))
            .build()
            .unwrap(),
    )
}

fn bounded(core: usize, max: usize) -> Arc<TimeoutEnforcingPool> {
    Arc::new(
        TimeoutEnforcingPool::builder()
            .core_size(core)
            .max_size(max)
            .work_queue(WorkQueue::Unbounded)
            .build()
            .unwrap(),
    )
}

fn no_task_loss<S: TaskScheduler + 'static>(pool: Arc<S>) {
    const SUBMITTERS: usize = 4;
    const PER: usize = 500;
    let ran = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|_| {
            let pool = pool.clone();
            let ran = ran.clone();
            thread::spawn(move || {
                (0..PER)
                    .map(|i| {
                        let ran = ran.clone();
                        pool.submit(
                            move || {
                                ran.fetch_add(1, Ordering::Relaxed);
                                i
                            },
                            LONG,
                        )
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in submitters {
        for (i, cell) in handle.join().unwrap().into_iter().enumerate() {
            assert_eq!(cell.get().unwrap(), i);
            assert!(cell.is_done());
        }
    }
    assert_eq!(ran.load(Ordering::Relaxed), SUBMITTERS * PER);
}

#[test]
fn stealing_pool_loses_nothing() {
    no_task_loss(stealing(4));
}

#[test]
fn timeout_pool_loses_nothing() {
    no_task_loss(bounded(4, 4));
}

fn timeout_never_early<S: TaskScheduler>(pool: &S) {
    let budget = Duration::from_millis(40);
    let start = Instant::now();
    let cell = pool.submit(|| thread::sleep(Duration::from_millis(500)), budget);
    let err = cell.get().unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, TaskError::TimedOut(d) if d == budget));
    assert!(elapsed >= budget, "timed out after {:?}", elapsed);
    assert!(cell.is_timed_out());
    assert!(!cell.is_cancelled());
}

#[test]
fn timeouts_fire_at_or_after_budget() {
    timeout_never_early(&*stealing(2));
    timeout_never_early(&*bounded(2, 2));
}

#[test]
fn default_values_cover_every_failure_kind() {
    let pool = stealing(2);
    let works: Vec<Box<dyn FnOnce() -> &'static str + Send>> = vec![
        Box::new(|| "ok"),
        Box::new(|| panic!("broken")),
        Box::new(|| {
            thread::sleep(Duration::from_millis(300));
            "late"
        }),
    ];
    let cells = pool.submit_all_with_default_value(works, Duration::from_millis(50), "default");
    let values: Vec<_> = cells.iter().map(|c| c.get().unwrap()).collect();
    assert_eq!(values, vec!["ok", "default", "default"]);
    assert!(cells.iter().all(|c| !c.is_failed()));
}

#[test]
fn default_values_cover_rejection() {
    let pool = bounded(1, 1);
    pool.shutdown();
    let works: Vec<fn() -> i32> = vec![|| 1, || 2];
    let cells = pool.submit_all_with_default_value(works, LONG, 0);
    assert_eq!(cells.iter().map(|c| c.get().unwrap()).sum::<i32>(), 0);
}

#[test]
fn map_async_chains_across_pools() {
    let first = bounded(2, 2);
    let second = stealing(2);
    let cell = first
        .submit(|| 20, LONG)
        .map_async(|v| v + 1, &second, LONG)
        .map_sync(|v| v * 2);
    assert_eq!(cell.get().unwrap(), 42);
}

#[test]
fn map_async_skips_failed_source() {
    let pool = stealing(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    let source: CompletionCell<i32> = CompletionCell::failed(TaskError::Cancelled);
    let mapped = source.map_async(
        move |v| {
            r.fetch_add(1, Ordering::SeqCst);
            v
        },
        &pool,
        LONG,
    );
    assert!(mapped.is_cancelled());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn combinators_over_pool_results() {
    let pool = stealing(4);
    let cells: Vec<_> = (1..=5).map(|i| pool.submit(move || i, LONG)).collect();
    assert_eq!(lift(&cells).get().unwrap(), vec![1, 2, 3, 4, 5]);

    let pair = zip(&cells[0], &cells[4]);
    assert_eq!(pair.get().unwrap(), (1, 5));

    let racers = vec![
        pool.submit(
            || {
                thread::sleep(Duration::from_millis(200));
                "slow"
            },
            LONG,
        ),
        pool.submit(|| "fast", LONG),
    ];
    assert_eq!(any_of(&racers).get().unwrap(), "fast");

    let sum = fold_async(&*pool, cells, 0, |acc, v| acc + v, LONG);
    assert_eq!(sum.get().unwrap(), 15);
}

#[test]
fn cancelling_queued_task_prevents_run() {
    let pool = bounded(1, 1);
    let gate = Arc::new(AtomicUsize::new(0));
    let g = gate.clone();
    let blocker = pool.submit(
        move || {
            while g.load(Ordering::Acquire) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        },
        LONG,
    );
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    let queued = pool.submit(
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
        LONG,
    );
    assert!(queued.cancel(false));
    gate.store(1, Ordering::Release);
    blocker.get().unwrap();
    pool.shutdown();
    assert!(pool.await_termination(LONG));
    assert!(queued.is_cancelled());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn shutdown_never_runs_new_work() {
    let pool = stealing(2);
    let before = pool.submit(|| 1, LONG);
    pool.shutdown();
    let after = pool.submit(|| 2, LONG);
    assert!(matches!(
        after.get(),
        Err(TaskError::Rejected(RejectReason::Shutdown))
    ));
    assert!(pool.await_termination(LONG));
    assert_eq!(before.get().unwrap(), 1);
}

#[test]
fn breaker_over_stealing_pool() {
    let breaker = CircuitBreaker::new(
        stealing(2),
        BreakerOptions {
            failure_threshold: 2,
            recovery_delay: Duration::from_secs(60),
        },
    )
    .unwrap();
    for _ in 0..2 {
        let cell = breaker.submit_fallible(|| Err::<(), _>("down"), LONG);
        assert!(cell.get().is_err());
    }
    let deadline = Instant::now() + LONG;
    while breaker.state() != BreakerState::Open && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    let works: Vec<fn() -> i32> = vec![|| 1, || 2];
    let cells = breaker.submit_all(works, LONG);
    assert!(cells
        .iter()
        .all(|c| matches!(c.get(), Err(TaskError::Rejected(RejectReason::CircuitOpen)))));
}
