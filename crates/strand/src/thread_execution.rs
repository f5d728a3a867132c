//! Driving a single executor from a dedicated loop.
//!
//! [`LocalExecution`] runs the wait/update loop on the calling thread;
//! [`SingleThreadExecution`] moves the same loop onto a worker thread it
//! owns. Both drive exactly one executor through a
//! [`ThreadExecutionContext`], whose condition variable reconciles the three
//! wake-up producers: immediate wake-ups, scheduled deadlines, and stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::context::ExecutionContext;
use crate::executor::Executor;

#[derive(Debug)]
struct WaitState {
    has_work: bool,
    scheduled_wake_up: Option<Instant>,
}

/// The context used by [`LocalExecution`] and [`SingleThreadExecution`].
///
/// A small state machine under one mutex: a pending-work flag and an
/// optional deadline, with a condition variable connecting producers to the
/// single waiting consumer.
pub struct ThreadExecutionContext {
    running: AtomicBool,
    state: Mutex<WaitState>,
    work_available: Condvar,
}

impl ThreadExecutionContext {
    /// A fresh context: running, with work pending so that the first
    /// [`wait`](Self::wait) returns immediately and the executor gets an
    /// initial `update`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            state: Mutex::new(WaitState {
                has_work: true,
                scheduled_wake_up: None,
            }),
            work_available: Condvar::new(),
        }
    }

    /// Block until there is work to do.
    ///
    /// Returns when a wake-up was requested or a scheduled deadline passed;
    /// in both cases the pending state is consumed. Spurious wake-ups simply
    /// re-enter the wait.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        loop {
            if state.has_work {
                state.has_work = false;
                // An immediate wake-up supersedes any scheduled one.
                state.scheduled_wake_up = None;
                return;
            }

            match state.scheduled_wake_up {
                Some(deadline) => {
                    if self
                        .work_available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        // The timer fired and is consumed.
                        state.has_work = true;
                        state.scheduled_wake_up = None;
                    }
                    // A non-timeout wake means work arrived, the schedule
                    // changed, or the wake was spurious; the loop re-checks.
                }
                None => self.work_available.wait(&mut state),
            }
        }
    }
}

impl ExecutionContext for ThreadExecutionContext {
    fn wake_up_now(&self) {
        {
            let mut state = self.state.lock();
            state.has_work = true;
        }
        self.work_available.notify_one();
    }

    fn schedule_next_wake_up(&self, after: Duration) {
        {
            let mut state = self.state.lock();
            state.scheduled_wake_up = Some(Instant::now() + after);
        }
        // The waiter re-arms on the new deadline.
        self.work_available.notify_one();
    }

    fn unschedule_next_wake_up(&self) {
        {
            let mut state = self.state.lock();
            state.scheduled_wake_up = None;
        }
        self.work_available.notify_one();
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake_up_now();
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Default for ThreadExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one executor with a blocking loop on whichever thread calls
/// [`run`](LocalExecution::run).
///
/// Creating a `LocalExecution` binds a [`ThreadExecutionContext`] to the
/// executor, so wake-ups issued from any thread reach the loop.
#[derive(Clone)]
pub struct LocalExecution {
    executor: Arc<dyn Executor>,
    context: Arc<ThreadExecutionContext>,
}

impl LocalExecution {
    /// Bind a fresh context to `executor`.
    ///
    /// # Panics
    ///
    /// Panics if the executor already has a context bound.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        let context = Arc::new(ThreadExecutionContext::new());
        executor.context().bind(context.clone());
        Self { executor, context }
    }

    /// The context driving the bound executor.
    #[must_use]
    pub fn context(&self) -> &Arc<ThreadExecutionContext> {
        &self.context
    }

    /// Run the executor until it is stopped, then finalize it.
    ///
    /// Blocks the calling thread. The update that observes the stop is the
    /// last one; `finalize` runs exactly once afterwards.
    pub fn run(&self) {
        while self.context.running() {
            self.context.wait();
            self.executor.update();
        }
        tracing::debug!("execution loop stopped, finalizing executor");
        self.executor.finalize();
    }
}

/// Owns one worker thread running a [`LocalExecution`] loop.
///
/// Dropping the execution stops the executor and joins the thread.
pub struct SingleThreadExecution {
    execution: LocalExecution,
    thread: Option<JoinHandle<()>>,
}

impl SingleThreadExecution {
    /// Bind a fresh context to `executor`. The worker thread is not started
    /// until [`launch_thread`](Self::launch_thread).
    ///
    /// # Panics
    ///
    /// Panics if the executor already has a context bound.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            execution: LocalExecution::new(executor),
            thread: None,
        }
    }

    /// Start the worker thread, optionally giving it an OS-level name.
    ///
    /// A name the platform rejects (say, longer than the POSIX limit) is
    /// logged and otherwise ignored.
    ///
    /// # Panics
    ///
    /// Panics if the thread has already been launched, or if the OS refuses
    /// to spawn a thread.
    pub fn launch_thread(&mut self, name: Option<&str>) {
        assert!(self.thread.is_none(), "execution thread already launched");

        let execution = self.execution.clone();
        let name = name.map(str::to_owned);
        let handle = thread::Builder::new()
            .spawn(move || {
                if let Some(name) = &name {
                    if let Err(error) = strand_thread_name::set_current_thread_name(name) {
                        tracing::warn!(name = %name, %error, "could not name execution thread");
                    }
                }
                execution.run();
            })
            .expect("failed to spawn execution thread");
        self.thread = Some(handle);
    }

    /// Wait for the worker thread to finish.
    ///
    /// Unless something stops the execution this waits indefinitely.
    pub fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("execution thread terminated by panic");
            }
        }
    }

    /// Stop the execution and wait for the worker thread to finish.
    pub fn stop_and_join_thread(&mut self) {
        self.execution.context().stop();
        self.join_thread();
    }

    /// The id of the worker thread, if it has been launched.
    #[must_use]
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.as_ref().map(|thread| thread.thread().id())
    }
}

impl Drop for SingleThreadExecution {
    fn drop(&mut self) {
        self.stop_and_join_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextHandle;
    use std::sync::atomic::AtomicUsize;

    struct CountingExecutor {
        handle: ContextHandle,
        updates: AtomicUsize,
        finalizes: AtomicUsize,
    }

    impl CountingExecutor {
        fn new() -> Self {
            Self {
                handle: ContextHandle::new(),
                updates: AtomicUsize::new(0),
                finalizes: AtomicUsize::new(0),
            }
        }
    }

    impl Executor for CountingExecutor {
        fn context(&self) -> &ContextHandle {
            &self.handle
        }

        fn update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn finalize(&self) {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wait_returns_immediately_on_fresh_context() {
        let context = ThreadExecutionContext::new();
        // Fresh contexts report work so that the first update always runs.
        context.wait();
    }

    #[test]
    fn wake_up_clears_scheduled_deadline() {
        let context = ThreadExecutionContext::new();
        context.wait(); // consume the initial work

        context.schedule_next_wake_up(Duration::from_secs(100));
        context.wake_up_now();
        let started = Instant::now();
        context.wait();
        assert!(started.elapsed() < Duration::from_secs(1));

        // The schedule was superseded; nothing should be pending now.
        let state = context.state.lock();
        assert!(!state.has_work);
        assert!(state.scheduled_wake_up.is_none());
    }

    #[test]
    fn scheduled_deadline_fires_as_work() {
        let context = ThreadExecutionContext::new();
        context.wait();

        context.schedule_next_wake_up(Duration::from_millis(20));
        let started = Instant::now();
        context.wait();
        assert!(started.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn stop_and_join_finalizes_exactly_once() {
        let executor = Arc::new(CountingExecutor::new());
        let mut execution = SingleThreadExecution::new(executor.clone());
        execution.launch_thread(Some("strand-test"));

        execution.stop_and_join_thread();
        execution.stop_and_join_thread(); // idempotent

        assert_eq!(executor.finalizes.load(Ordering::SeqCst), 1);
        // The initial pending work gives at least one update.
        assert!(executor.updates.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn drop_stops_and_joins() {
        let executor = Arc::new(CountingExecutor::new());
        {
            let mut execution = SingleThreadExecution::new(executor.clone());
            execution.launch_thread(None);
        }
        assert_eq!(executor.finalizes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn local_execution_runs_on_calling_thread() {
        let executor = Arc::new(CountingExecutor::new());
        let execution = LocalExecution::new(executor.clone());

        let context = execution.context().clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            context.stop();
        });

        execution.run();
        stopper.join().unwrap();

        assert!(executor.updates.load(Ordering::SeqCst) >= 1);
        assert_eq!(executor.finalizes.load(Ordering::SeqCst), 1);
    }
}
