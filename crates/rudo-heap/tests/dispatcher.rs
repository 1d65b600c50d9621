//! Integration tests for worker dispatch and phase barriers.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rudo_heap::gc::{Dispatcher, Task, WorkerEnv};

/// Two phases of work units separated by a barrier; the counter restarts
/// for the second phase.
struct Phased {
    first: Vec<AtomicUsize>,
    second: Vec<AtomicUsize>,
    owners: Mutex<Vec<usize>>,
}

impl Phased {
    fn new(units: usize) -> Self {
        Self {
            first: (0..units).map(|_| AtomicUsize::new(0)).collect(),
            second: (0..units).map(|_| AtomicUsize::new(0)).collect(),
            owners: Mutex::new(Vec::new()),
        }
    }
}

impl Task for Phased {
    fn run(&self, env: &WorkerEnv<'_>) {
        for unit in &self.first {
            if env.handle_next_work_unit() {
                unit.fetch_add(1, Ordering::Relaxed);
            }
        }
        env.sync_all();
        // Everything from the first phase is visible here.
        assert!(self.first.iter().all(|unit| unit.load(Ordering::Relaxed) == 1));
        for unit in &self.second {
            if env.handle_next_work_unit() {
                unit.fetch_add(1, Ordering::Relaxed);
                self.owners.lock().push(env.worker_id());
            }
        }
    }
}

#[test]
fn test_work_units_restart_after_barrier() {
    for threads in [1, 2, 5] {
        let task = Phased::new(300);
        Dispatcher::new(threads).run(&task);
        assert!(task.second.iter().all(|unit| unit.load(Ordering::Relaxed) == 1));
        let owners = task.owners.into_inner();
        assert_eq!(owners.len(), 300);
        assert!(owners.iter().all(|&id| id < threads));
    }
}

/// The master builds shared state that every worker then reads.
struct MasterBuilds {
    table: Mutex<Vec<usize>>,
    sums: AtomicUsize,
}

impl Task for MasterBuilds {
    fn run(&self, env: &WorkerEnv<'_>) {
        if env.sync_and_release_master() {
            assert!(env.is_master());
            *self.table.lock() = (1..=10).collect();
            env.release_synchronized();
        }
        let sum: usize = self.table.lock().iter().sum();
        self.sums.fetch_add(sum, Ordering::Relaxed);
    }
}

#[test]
fn test_master_section_is_visible_to_all_workers() {
    let dispatcher = Dispatcher::new(4);
    for _ in 0..3 {
        let task = MasterBuilds {
            table: Mutex::new(Vec::new()),
            sums: AtomicUsize::new(0),
        };
        dispatcher.run(&task);
        assert_eq!(task.sums.load(Ordering::Relaxed), 55 * 4);
    }
}

struct FailAfterBarrier;

impl Task for FailAfterBarrier {
    fn run(&self, env: &WorkerEnv<'_>) {
        env.sync_all();
        if env.worker_id() == 1 {
            panic!("second phase failed");
        }
        env.sync_all();
        env.sync_all();
    }
}

#[test]
#[should_panic(expected = "second phase failed")]
fn test_panic_after_barrier_releases_peers() {
    Dispatcher::new(3).run(&FailAfterBarrier);
}
