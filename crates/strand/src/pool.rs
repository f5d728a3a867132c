//! A bounded worker set multiplexing many executors.
//!
//! Every registered executor gets its own context; the pool tracks each
//! context in exactly one of three places:
//!
//! - `pending` — ready to run, in FIFO order (fairness),
//! - `active` — currently dispatched on some worker (serialization),
//! - `scheduled` — waiting on a deadline in a timed queue.
//!
//! Workers loop through [`PoolShared::wait_for_context`]: release the
//! context they just ran (reconciling its scheduled wake-up with the timed
//! queue), promote ripe timers into `pending`, take the first pending
//! context that no other worker owns, and otherwise sleep on the pool
//! condvar — until the earliest deadline if there is one, indefinitely
//! otherwise.
//!
//! An executor is never dispatched by two workers at once: a context must
//! move from `pending` into `active` to be run, and the insert fails while
//! another worker holds it. Redundant wake-ups collapse on the `pending`
//! insert the same way.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::context::ExecutionContext;
use crate::executor::Executor;
use crate::ordered_set::OrderedLinearSet;
use crate::timed_queue::{Timed, TimedQueue};

// ============================================================================
// Per-executor context
// ============================================================================

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The context handed to each executor registered with a pool.
struct PoolContext {
    id: u64,
    running: AtomicBool,
    /// Written while the executor is being dispatched (or during release
    /// reconciliation); observed by the pool only when the context is
    /// released by its worker.
    scheduled_wake_up: Mutex<Option<Instant>>,
    pool: Weak<PoolShared>,
}

impl PoolContext {
    fn new(pool: &Arc<PoolShared>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            running: AtomicBool::new(true),
            scheduled_wake_up: Mutex::new(None),
            pool: Arc::downgrade(pool),
        })
    }

    /// Ask the pool to dispatch this context as soon as a worker is free.
    fn request_dispatch(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        {
            let mut state = pool.state.lock();
            if !state.pending.insert(self.id) {
                // Already pending: a worker is on its way, and notifying
                // again would only cause needless wake-ups.
                return;
            }
            // Pending dominates any scheduled wake-up.
            state.scheduled.erase_first(|entry| entry.id == self.id);
        }
        pool.work_available.notify_one();
    }
}

impl ExecutionContext for PoolContext {
    fn wake_up_now(&self) {
        if self.running() {
            self.request_dispatch();
        }
    }

    fn schedule_next_wake_up(&self, after: Duration) {
        *self.scheduled_wake_up.lock() = Some(Instant::now() + after);
    }

    fn unschedule_next_wake_up(&self) {
        *self.scheduled_wake_up.lock() = None;
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // The flip winner requests one final dispatch so a worker can
            // observe the stop and finalize the executor.
            self.request_dispatch();
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

// ============================================================================
// Shared pool state
// ============================================================================

struct ScheduledEntry {
    time: Instant,
    id: u64,
}

impl Timed for ScheduledEntry {
    fn time(&self) -> Instant {
        self.time
    }

    fn set_time(&mut self, time: Instant) {
        self.time = time;
    }
}

struct Registration {
    context: Arc<PoolContext>,
    executor: Arc<dyn Executor>,
}

struct PoolState {
    running: bool,
    /// The deadline the sleeping workers are armed on, if any.
    wakeup_deadline: Option<Instant>,
    pending: OrderedLinearSet<u64>,
    active: OrderedLinearSet<u64>,
    scheduled: TimedQueue<ScheduledEntry>,
    all: FxHashMap<u64, Registration>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
}

struct Dispatch {
    context: Arc<PoolContext>,
    executor: Arc<dyn Executor>,
}

impl PoolShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                running: true,
                wakeup_deadline: None,
                pending: OrderedLinearSet::new(),
                active: OrderedLinearSet::new(),
                scheduled: TimedQueue::new(),
                all: FxHashMap::default(),
            }),
            work_available: Condvar::new(),
        })
    }

    /// Release the previously dispatched context (if any) and block until
    /// another one is ready, or until the pool is stopped and drained.
    fn wait_for_context(&self, released: Option<Arc<PoolContext>>) -> Option<Dispatch> {
        let mut guard = self.state.lock();

        if let Some(context) = released {
            let state = &mut *guard;
            state.active.erase(&context.id);

            // Reconcile the context's scheduled wake-up with the timed
            // queue. This is the only point where schedules become visible
            // to the pool, which keeps producers from churning the queue
            // while the executor runs.
            let wake_at = *context.scheduled_wake_up.lock();
            match wake_at {
                Some(time) if !state.pending.contains(&context.id) => {
                    state.scheduled.push(ScheduledEntry {
                        time,
                        id: context.id,
                    });
                }
                Some(_) => {
                    // Already pending; the immediate wake-up dominates.
                }
                None => {
                    state.scheduled.erase_first(|entry| entry.id == context.id);
                }
            }
        }

        loop {
            {
                let state = &mut *guard;

                // Promote ripe timers into the pending set and re-arm the
                // pool deadline on the new top.
                if !state.scheduled.is_empty() {
                    let now = Instant::now();
                    while let Some(top_time) = state.scheduled.peek().map(|top| top.time) {
                        if top_time > now {
                            state.wakeup_deadline = Some(top_time);
                            break;
                        }
                        let Some(ripe) = state.scheduled.pop() else {
                            break;
                        };
                        // A fired timer is consumed whether or not it ends
                        // up producing work.
                        if let Some(registration) = state.all.get(&ripe.id) {
                            *registration.context.scheduled_wake_up.lock() = None;
                        }
                        state.pending.insert(ripe.id);
                        if state.scheduled.is_empty() {
                            state.wakeup_deadline = None;
                        }
                    }
                }

                // Take the first pending context not already owned by
                // another worker. Collisions are skipped, so one busy
                // executor never blocks progress on the others.
                let mut index = 0;
                while index < state.pending.len() {
                    let Some(&id) = state.pending.get(index) else {
                        break;
                    };
                    if !state.active.insert(id) {
                        index += 1;
                        continue;
                    }
                    state.pending.remove_at(index);
                    match state.all.get(&id) {
                        Some(registration) => {
                            return Some(Dispatch {
                                context: Arc::clone(&registration.context),
                                executor: Arc::clone(&registration.executor),
                            });
                        }
                        None => {
                            // The registry no longer knows this context;
                            // drop the stale entry and keep scanning.
                            state.active.erase(&id);
                        }
                    }
                }

                if !state.running {
                    // Stopped and nothing pending: every context has been
                    // finalized. Scheduled entries are deliberately skipped.
                    return None;
                }
            }

            match guard.wakeup_deadline {
                Some(deadline) => {
                    if self
                        .work_available
                        .wait_until(&mut guard, deadline)
                        .timed_out()
                    {
                        // The deadline was consumed; the promote step above
                        // turns it into pending work.
                        guard.wakeup_deadline = None;
                    }
                    // Several workers may wake on the same deadline; all of
                    // them re-check the state, and the ones that find
                    // nothing go back to sleep.
                }
                None => self.work_available.wait(&mut guard),
            }
        }
    }

    /// The worker loop: dispatch contexts until the pool stops and drains.
    fn serve(self: &Arc<Self>) {
        let mut released: Option<Arc<PoolContext>> = None;
        loop {
            let Some(Dispatch { context, executor }) =
                self.wait_for_context(released.take())
            else {
                return;
            };

            if context.running() {
                if panic::catch_unwind(AssertUnwindSafe(|| executor.update())).is_err() {
                    tracing::error!(context = context.id, "executor update panicked");
                }
            } else {
                // The stop flag fell since the last dispatch: this is the
                // sole finalization path, entered at most once per context
                // because the registration is removed here.
                {
                    let mut state = self.state.lock();
                    state.all.remove(&context.id);
                }
                tracing::debug!(context = context.id, "finalizing stopped executor");
                if panic::catch_unwind(AssertUnwindSafe(|| executor.finalize())).is_err() {
                    tracing::error!(context = context.id, "executor finalize panicked");
                }
                // Finalize may have inadvertently scheduled wake-ups; the
                // context is dead, so drop them.
                context.unschedule_next_wake_up();
            }

            released = Some(context);
        }
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// Worker-thread parameters for [`PoolExecution::launch`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Base OS-level thread name; more than one worker gets a numeric
    /// suffix starting at 1.
    pub thread_name: Option<String>,
    /// Stack size per worker thread.
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |count| count.get()),
            thread_name: None,
            stack_size: 2 * 1024 * 1024,
        }
    }
}

/// A pool of workers dispatching any registered executor with work, while
/// keeping every executor serialized.
///
/// Dropping the pool stops it and joins its launched workers.
pub struct PoolExecution {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolExecution {
    /// An empty pool with no workers launched.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: PoolShared::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Register `executor` and bind a pool context to it. Safe from any
    /// thread; the executor receives an initial dispatch.
    ///
    /// # Panics
    ///
    /// Panics if the executor already has a context bound.
    pub fn add_executor(&self, executor: Arc<dyn Executor>) {
        let context = PoolContext::new(&self.shared);
        {
            let mut state = self.shared.state.lock();
            state.pending.insert(context.id);
            state.all.insert(
                context.id,
                Registration {
                    context: Arc::clone(&context),
                    executor: Arc::clone(&executor),
                },
            );
        }
        tracing::debug!(context = context.id, "executor registered with pool");
        // Bind outside the pool lock: replaying buffered wake-ups or stops
        // re-enters the pool mutex.
        executor.context().bind(context);
        self.shared.work_available.notify_one();
    }

    /// Serve the pool with the calling thread until it stops and drains.
    pub fn run(&self) {
        self.shared.serve();
    }

    /// Stop the pool and every registered executor. Idempotent; safe from
    /// any thread.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;

            // Stop each context inline under the pool lock; going through
            // the public per-context stop would re-enter the mutex.
            let contexts: Vec<Arc<PoolContext>> = state
                .all
                .values()
                .map(|registration| Arc::clone(&registration.context))
                .collect();
            for context in contexts {
                if context.running.swap(false, Ordering::AcqRel)
                    && state.pending.insert(context.id)
                {
                    state.scheduled.erase_first(|entry| entry.id == context.id);
                }
            }
        }
        tracing::debug!("pool stopped");
        self.shared.work_available.notify_all();
    }

    /// Launch `count` worker threads, optionally named.
    ///
    /// A single worker gets the name verbatim; several get a numeric suffix
    /// starting at 1.
    pub fn launch_threads(&self, count: usize, name: Option<&str>) {
        let mut threads = self.threads.lock();
        threads.reserve(count);
        for index in 0..count {
            let worker_name = name.map(|base| {
                if count == 1 {
                    base.to_owned()
                } else {
                    format!("{base}{}", index + 1)
                }
            });
            threads.push(self.spawn_worker(worker_name, None));
        }
    }

    /// Launch workers according to `config`.
    pub fn launch(&self, config: PoolConfig) {
        let mut threads = self.threads.lock();
        threads.reserve(config.workers);
        for index in 0..config.workers {
            let worker_name = config.thread_name.as_deref().map(|base| {
                if config.workers == 1 {
                    base.to_owned()
                } else {
                    format!("{base}{}", index + 1)
                }
            });
            threads.push(self.spawn_worker(worker_name, Some(config.stack_size)));
        }
    }

    fn spawn_worker(&self, name: Option<String>, stack_size: Option<usize>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut builder = thread::Builder::new();
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder
            .spawn(move || {
                if let Some(name) = &name {
                    if let Err(error) = strand_thread_name::set_current_thread_name(name) {
                        tracing::warn!(name = %name, %error, "could not name pool worker");
                    }
                }
                shared.serve();
            })
            .expect("failed to spawn pool worker thread")
    }

    /// Wait for every launched worker to finish.
    ///
    /// Unless someone stops the pool this waits indefinitely.
    pub fn join_threads(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("pool worker terminated by panic");
            }
        }

        #[cfg(debug_assertions)]
        {
            let state = self.shared.state.lock();
            debug_assert!(state.all.is_empty(), "contexts left registered after join");
            debug_assert!(state.active.is_empty(), "contexts left active after join");
            debug_assert!(state.pending.is_empty(), "contexts left pending after join");
        }
    }

    /// Stop the pool and wait for the workers to finish.
    pub fn stop_and_join_threads(&self) {
        self.stop();
        self.join_threads();
    }
}

impl Default for PoolExecution {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolExecution {
    fn drop(&mut self) {
        self.stop_and_join_threads();
    }
}
