//! Fork-join dispatch of collector tasks.
//!
//! [`Dispatcher::run`] forks `threads` workers over one [`Task`]; worker 0,
//! the master, runs on the calling thread. Workers meet at two kinds of
//! barrier:
//!
//! - [`WorkerEnv::sync_and_release_master`]: everyone arrives, the master
//!   alone continues and the others wait for
//!   [`WorkerEnv::release_synchronized`].
//! - [`WorkerEnv::sync_all`]: everyone arrives, everyone continues.
//!
//! Between barriers, workers split a sequence of work units with
//! [`WorkerEnv::handle_next_work_unit`]. Every worker walks the same sequence
//! and asks for each unit in turn; exactly one worker is told it owns it.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// Work run by every dispatched worker.
pub trait Task: Sync {
    /// Body run by each worker.
    fn run(&self, env: &WorkerEnv<'_>);

    /// Run once on the calling thread before the workers start.
    fn setup(&self) {}

    /// Run once on the calling thread after all workers finished.
    fn cleanup(&self) {}
}

/// Forks collector workers.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    threads: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
    }
}

impl Dispatcher {
    /// A dispatcher running `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Number of workers per task.
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.threads
    }

    /// Run `task` on every worker and wait for all of them.
    ///
    /// A panic in any worker releases the others from their barriers and is
    /// re-raised here once every worker has stopped.
    pub fn run<T: Task + ?Sized>(&self, task: &T) {
        task.setup();
        let shared = Shared::new(self.threads);
        if self.threads == 1 {
            task.run(&WorkerEnv::new(&shared, 0));
        } else {
            let joined = crossbeam::thread::scope(|scope| {
                for id in 1..self.threads {
                    let shared = &shared;
                    scope.spawn(move |_| shared.run_worker(task, id));
                }
                shared.run_worker(task, 0);
            });
            if let Some(payload) = shared.panic.lock().take() {
                panic::resume_unwind(payload);
            }
            if let Err(payload) = joined {
                panic::resume_unwind(payload);
            }
        }
        task.cleanup();
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    master_may_run: bool,
    poisoned: bool,
}

struct Shared {
    threads: usize,
    barrier: Mutex<BarrierState>,
    condvar: Condvar,
    work_units: AtomicUsize,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Shared {
    fn new(threads: usize) -> Self {
        Self {
            threads,
            barrier: Mutex::new(BarrierState::default()),
            condvar: Condvar::new(),
            work_units: AtomicUsize::new(0),
            panic: Mutex::new(None),
        }
    }

    fn run_worker<T: Task + ?Sized>(&self, task: &T, id: usize) {
        let env = WorkerEnv::new(self, id);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run(&env))) {
            self.panic.lock().get_or_insert(payload);
            self.barrier.lock().poisoned = true;
            self.condvar.notify_all();
        }
    }
}

/// A worker's view of the running task.
pub struct WorkerEnv<'a> {
    shared: &'a Shared,
    id: usize,
    units_seen: Cell<usize>,
    units_claimed: Cell<usize>,
}

impl<'a> WorkerEnv<'a> {
    fn new(shared: &'a Shared, id: usize) -> Self {
        Self {
            shared,
            id,
            units_seen: Cell::new(0),
            units_claimed: Cell::new(0),
        }
    }

    /// This worker's id; the master is `0`.
    #[must_use]
    pub const fn worker_id(&self) -> usize {
        self.id
    }

    /// Whether this worker is the master.
    #[must_use]
    pub const fn is_master(&self) -> bool {
        self.id == 0
    }

    /// Number of workers running the task.
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.shared.threads
    }

    fn reset_work_units(&self) {
        self.units_seen.set(0);
        self.units_claimed.set(0);
    }

    /// Claim the next unit of the current work sequence. Returns `true` if
    /// this worker owns it.
    pub fn handle_next_work_unit(&self) -> bool {
        if self.shared.threads == 1 {
            return true;
        }
        let seen = self.units_seen.get() + 1;
        self.units_seen.set(seen);
        if seen > self.units_claimed.get() {
            let ticket = self.shared.work_units.fetch_add(1, Ordering::AcqRel) + 1;
            self.units_claimed.set(ticket);
        }
        seen == self.units_claimed.get()
    }

    /// Wait for every worker. The master returns `true` and runs alone until
    /// it calls [`WorkerEnv::release_synchronized`]; the others return
    /// `false` once released.
    ///
    /// # Panics
    ///
    /// Panics if another worker panicked while this one was waiting.
    pub fn sync_and_release_master(&self) -> bool {
        self.reset_work_units();
        if self.shared.threads == 1 {
            return true;
        }
        let mut state = self.shared.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.shared.threads {
            state.arrived = 0;
            state.master_may_run = true;
            self.shared.condvar.notify_all();
        }
        if self.is_master() {
            while !state.master_may_run {
                assert!(!state.poisoned, "collector worker panicked at a barrier");
                self.shared.condvar.wait(&mut state);
            }
            state.master_may_run = false;
            return true;
        }
        while state.generation == generation {
            assert!(!state.poisoned, "collector worker panicked at a barrier");
            self.shared.condvar.wait(&mut state);
        }
        false
    }

    /// Release the workers held by [`WorkerEnv::sync_and_release_master`].
    pub fn release_synchronized(&self) {
        debug_assert!(self.is_master(), "only the master releases a barrier");
        self.reset_work_units();
        if self.shared.threads == 1 {
            return;
        }
        let mut state = self.shared.barrier.lock();
        self.shared.work_units.store(0, Ordering::Release);
        state.generation += 1;
        self.shared.condvar.notify_all();
    }

    /// Wait until every worker arrives, then continue together.
    ///
    /// # Panics
    ///
    /// Panics if another worker panicked while this one was waiting.
    pub fn sync_all(&self) {
        self.reset_work_units();
        if self.shared.threads == 1 {
            return;
        }
        let mut state = self.shared.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.shared.threads {
            state.arrived = 0;
            self.shared.work_units.store(0, Ordering::Release);
            state.generation += 1;
            self.shared.condvar.notify_all();
            return;
        }
        while state.generation == generation {
            assert!(!state.poisoned, "collector worker panicked at a barrier");
            self.shared.condvar.wait(&mut state);
        }
    }
}

impl std::fmt::Debug for WorkerEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEnv")
            .field("id", &self.id)
            .field("threads", &self.shared.threads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct CountUnits {
        owners: Vec<AtomicUsize>,
    }

    impl Task for CountUnits {
        fn run(&self, env: &WorkerEnv<'_>) {
            for owner in &self.owners {
                if env.handle_next_work_unit() {
                    owner.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    #[test]
    fn test_work_units_owned_exactly_once() {
        for threads in [1, 2, 4, 7] {
            let task = CountUnits {
                owners: (0..1000).map(|_| AtomicUsize::new(0)).collect(),
            };
            Dispatcher::new(threads).run(&task);
            assert!(task.owners.iter().all(|o| o.load(Ordering::Relaxed) == 1));
        }
    }

    struct MasterSection {
        before: AtomicUsize,
        seen_by_master: AtomicUsize,
        after: AtomicUsize,
        releases: AtomicUsize,
    }

    impl Task for MasterSection {
        fn run(&self, env: &WorkerEnv<'_>) {
            self.before.fetch_add(1, Ordering::SeqCst);
            if env.sync_and_release_master() {
                self.seen_by_master.store(self.before.load(Ordering::SeqCst), Ordering::SeqCst);
                assert_eq!(self.after.load(Ordering::SeqCst), 0);
                self.releases.fetch_add(1, Ordering::SeqCst);
                env.release_synchronized();
            }
            self.after.fetch_add(1, Ordering::SeqCst);
            env.sync_all();
            assert_eq!(self.after.load(Ordering::SeqCst), env.thread_count());
        }
    }

    #[test]
    fn test_sync_and_release_master() {
        let task = MasterSection {
            before: AtomicUsize::new(0),
            seen_by_master: AtomicUsize::new(0),
            after: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        };
        Dispatcher::new(4).run(&task);
        assert_eq!(task.seen_by_master.load(Ordering::SeqCst), 4);
        assert_eq!(task.releases.load(Ordering::SeqCst), 1);
        assert_eq!(task.after.load(Ordering::SeqCst), 4);
    }

    struct Hooks {
        setup: AtomicBool,
        cleanup: AtomicBool,
    }

    impl Task for Hooks {
        fn run(&self, _env: &WorkerEnv<'_>) {
            assert!(self.setup.load(Ordering::SeqCst));
            assert!(!self.cleanup.load(Ordering::SeqCst));
        }

        fn setup(&self) {
            self.setup.store(true, Ordering::SeqCst);
        }

        fn cleanup(&self) {
            self.cleanup.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_setup_and_cleanup_hooks() {
        let task = Hooks {
            setup: AtomicBool::new(false),
            cleanup: AtomicBool::new(false),
        };
        Dispatcher::new(3).run(&task);
        assert!(task.cleanup.load(Ordering::SeqCst));
    }

    struct PanicInWorker;

    impl Task for PanicInWorker {
        fn run(&self, env: &WorkerEnv<'_>) {
            assert!(env.worker_id() != 2, "worker two failed");
            env.sync_all();
        }
    }

    #[test]
    #[should_panic(expected = "worker two failed")]
    fn test_worker_panic_is_propagated() {
        Dispatcher::new(4).run(&PanicInWorker);
    }

    #[test]
    fn test_dispatcher_clamps_threads() {
        assert_eq!(Dispatcher::new(0).thread_count(), 1);
        assert!(Dispatcher::default().thread_count() >= 1);
    }
}
