//! Integration tests for the multi-worker dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crystal_threading::{Dispatcher, DispatcherConfig, Work, Workgroup};

fn dispatcher(threads: usize) -> Dispatcher {
    Dispatcher::new(DispatcherConfig::with_threads(threads)).unwrap()
}

/// Poll until `predicate` holds or the timeout elapses.
fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

fn counting_item(counter: &Arc<AtomicUsize>) -> Arc<dyn Work> {
    let counter = counter.clone();
    Arc::new(move || {
        counter.fetch_add(1, Ordering::AcqRel);
    })
}

#[test]
fn thousand_items_all_finish_on_four_threads() {
    let dispatcher = dispatcher(4);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        dispatcher.push(counting_item(&counter));
    }

    assert_eq!(dispatcher.work(), 1000);
    assert_eq!(counter.load(Ordering::Acquire), 1000);
    dispatcher.terminate();
}

#[test]
fn items_pushed_from_inside_work_finish_before_return() {
    // 3 items each push 2 follow-ups from inside their own execution;
    // all 9 must finish before work() returns. This exercises the
    // in-flight counter, not just the depth check: when the queue
    // momentarily reads empty, a running item may still produce more.
    let dispatcher = Arc::new(dispatcher(4));
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let inner_dispatcher = dispatcher.clone();
        let outer_counter = counter.clone();
        dispatcher.push(Arc::new(move || {
            outer_counter.fetch_add(1, Ordering::AcqRel);
            for _ in 0..2 {
                inner_dispatcher.push(counting_item(&outer_counter));
            }
        }));
    }

    assert_eq!(dispatcher.work(), 9);
    assert_eq!(counter.load(Ordering::Acquire), 9);
    dispatcher.terminate();
}

#[test]
fn terminate_drops_queued_items_unexecuted() {
    // Items still queued at terminate() are silently dropped, never
    // executed.
    let dispatcher = dispatcher(4);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        dispatcher.push(counting_item(&counter));
    }

    dispatcher.terminate();
    assert_eq!(counter.load(Ordering::Acquire), 0);
}

#[test]
fn executions_match_pushes_exactly() {
    // An item runs exactly as many times as it was pushed, across
    // cycles.
    let dispatcher = dispatcher(3);
    let counter = Arc::new(AtomicUsize::new(0));
    let item = counting_item(&counter);

    dispatcher.push(item.clone());
    dispatcher.push(item.clone());
    assert_eq!(dispatcher.work(), 2);

    dispatcher.push(item.clone());
    assert_eq!(dispatcher.work(), 1);

    assert_eq!(counter.load(Ordering::Acquire), 3);
    dispatcher.terminate();
}

#[test]
fn push_and_signal_refuses_when_all_workers_busy() {
    // With every explicit worker mid-drain and the master not draining,
    // fail-fast admission must refuse and must not enqueue.
    let dispatcher = dispatcher(3); // 2 explicit workers
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));

    let blocker: Arc<dyn Work> = {
        let started = started.clone();
        let release = release.clone();
        Arc::new(move || {
            started.fetch_add(1, Ordering::AcqRel);
            while !release.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    // Occupy both workers, one at a time so each blocker lands on its own
    // thread.
    for occupied in 1..=2 {
        while !dispatcher.push_and_signal(blocker.clone(), true) {
            thread::yield_now();
        }
        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::Acquire) == occupied
        }));
    }

    let refused_counter = Arc::new(AtomicUsize::new(0));
    let refused = counting_item(&refused_counter);
    assert!(!dispatcher.push_and_signal(refused, true));

    release.store(true, Ordering::Release);
    // Let the blockers wind down completely before starting a cycle.
    thread::sleep(Duration::from_millis(200));

    // The refused item was never enqueued.
    assert_eq!(dispatcher.work(), 0);
    assert_eq!(refused_counter.load(Ordering::Acquire), 0);
    dispatcher.terminate();
}

#[test]
fn completed_cycle_leaves_nothing_behind() {
    // A second work() right after a drained cycle returns 0 and does
    // not block.
    let dispatcher = dispatcher(4);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        dispatcher.push(counting_item(&counter));
    }
    assert_eq!(dispatcher.work(), 50);
    assert_eq!(dispatcher.work(), 0);
    dispatcher.terminate();
}

#[test]
fn spawned_thread_count_is_one_less_than_requested() {
    // Requesting K threads spawns max(0, K-1) workers; the caller is
    // the implicit extra one.
    for requested in [0usize, 1, 2, 5] {
        let dispatcher = dispatcher(requested);
        assert_eq!(dispatcher.num_threads(), requested);
        assert_eq!(dispatcher.spawned_workers(), requested.saturating_sub(1));
        dispatcher.terminate();
    }
}

#[test]
fn first_run_and_affinity_config_are_accepted() {
    let mut config = DispatcherConfig::with_threads(2);
    config.use_cpu_affinity = true;
    config.cpu_offset = 0;
    config.name = Some("affine".to_string());
    let dispatcher = Dispatcher::new(config).unwrap();

    dispatcher.first_run();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        dispatcher.push(counting_item(&counter));
    }
    assert_eq!(dispatcher.work(), 32);
    dispatcher.terminate();
}

#[test]
fn workers_join_and_leave_the_workgroup() {
    struct CountingGroup {
        joins: AtomicUsize,
        leaves: AtomicUsize,
    }
    impl Workgroup for CountingGroup {
        fn join(&self) {
            self.joins.fetch_add(1, Ordering::AcqRel);
        }
        fn leave(&self) {
            self.leaves.fetch_add(1, Ordering::AcqRel);
        }
    }

    let group = Arc::new(CountingGroup {
        joins: AtomicUsize::new(0),
        leaves: AtomicUsize::new(0),
    });

    let mut config = DispatcherConfig::with_threads(3);
    // Pinning must yield to the platform grouping; the dispatcher accepts
    // both being set.
    config.use_cpu_affinity = true;
    config.workgroup = Some(group.clone());
    let dispatcher = Dispatcher::new(config).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        group.joins.load(Ordering::Acquire) == 2
    }));

    dispatcher.terminate();
    assert_eq!(group.leaves.load(Ordering::Acquire), 2);
}

#[test]
fn dropping_the_dispatcher_terminates_it() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let dispatcher = dispatcher(3);
        for _ in 0..5 {
            dispatcher.push(counting_item(&counter));
        }
        // No work() call: drop discards the queue.
    }
    assert_eq!(counter.load(Ordering::Acquire), 0);
}
