//! The execution-context contract and the executor-side handle to it.
//!
//! An execution context is the scheduling half of an executor: producers ask
//! it to run the executor soon ([`ExecutionContext::wake_up_now`]), at a
//! deadline ([`ExecutionContext::schedule_next_wake_up`]), or never again
//! ([`ExecutionContext::stop`]). How those requests turn into `update()`
//! calls is up to the execution that created the context — a dedicated
//! thread, or a shared worker pool.
//!
//! Executors hold their context through a [`ContextHandle`]. Until a real
//! context is bound, the handle buffers requests so that nothing issued
//! before the executor is attached to an execution is lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// The scheduling side of an executor.
///
/// All operations are safe to call from any thread.
pub trait ExecutionContext: Send + Sync {
    /// Request that the executor's `update()` runs as soon as possible.
    ///
    /// Idempotent: concurrent requests collapse into at least one future
    /// `update()` call. Overrides any scheduled wake-up.
    fn wake_up_now(&self);

    /// Request an `update()` once `after` has elapsed.
    ///
    /// A newer schedule overrides an older one; a [`wake_up_now`] issued
    /// before the deadline fires makes the schedule forgotten.
    ///
    /// [`wake_up_now`]: ExecutionContext::wake_up_now
    fn schedule_next_wake_up(&self, after: Duration);

    /// Drop any pending scheduled wake-up.
    fn unschedule_next_wake_up(&self);

    /// Terminate execution at the next convenient point. Monotonic.
    fn stop(&self);

    /// Whether the context has not been stopped yet.
    fn running(&self) -> bool;
}

/// A context that discards every request.
///
/// Useful as a stand-in when an executor has to be exercised without any
/// execution behind it. It reports itself as running forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutionContext;

impl ExecutionContext for NoopExecutionContext {
    fn wake_up_now(&self) {}
    fn schedule_next_wake_up(&self, _after: Duration) {}
    fn unschedule_next_wake_up(&self) {}
    fn stop(&self) {}

    fn running(&self) -> bool {
        true
    }
}

/// Requests recorded before a real context is bound.
///
/// Only the dominant request survives: stop beats wake-up beats schedule,
/// and of several schedules only the last one is kept.
#[derive(Debug, Default)]
struct BufferedRequests {
    stopped: bool,
    wake_requested: bool,
    scheduled_wake_up: Option<Instant>,
}

enum HandleState {
    /// No execution attached yet; requests are buffered.
    Initial(BufferedRequests),
    /// Attached to a real context; requests are forwarded.
    Bound(Arc<dyn ExecutionContext>),
}

/// An executor's swappable-once handle to its execution context.
///
/// A freshly created handle buffers every request. [`ContextHandle::bind`]
/// installs the real context exactly once and replays the buffered state
/// onto it; binding a second time is a contract violation and panics.
pub struct ContextHandle {
    state: Mutex<HandleState>,
}

impl ContextHandle {
    /// A handle with no context attached; requests are buffered until
    /// [`ContextHandle::bind`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandleState::Initial(BufferedRequests::default())),
        }
    }

    /// A handle already attached to `context`.
    #[must_use]
    pub fn with_context(context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            state: Mutex::new(HandleState::Bound(context)),
        }
    }

    /// Whether a real context has been attached.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(&*self.state.lock(), HandleState::Bound(_))
    }

    /// Attach the real execution context and replay any buffered requests.
    ///
    /// # Panics
    ///
    /// Panics if a context has already been attached.
    pub fn bind(&self, context: Arc<dyn ExecutionContext>) {
        let buffered = {
            let mut state = self.state.lock();
            assert!(
                matches!(&*state, HandleState::Initial(_)),
                "execution context already bound"
            );
            let previous =
                std::mem::replace(&mut *state, HandleState::Bound(Arc::clone(&context)));
            match previous {
                HandleState::Initial(buffered) => buffered,
                HandleState::Bound(_) => unreachable!(),
            }
        };

        // Replay outside the handle lock; context calls may take their own
        // (execution-side) locks.
        if buffered.stopped {
            tracing::trace!("replaying buffered stop onto bound context");
            context.stop();
        } else if buffered.wake_requested {
            context.wake_up_now();
        } else if let Some(at) = buffered.scheduled_wake_up {
            let now = Instant::now();
            if at <= now {
                context.wake_up_now();
            } else {
                context.schedule_next_wake_up(at - now);
            }
        }
    }

    /// Run `forward` against the bound context, or `buffer` against the
    /// initial state when nothing is bound yet.
    fn dispatch<R>(
        &self,
        buffer: impl FnOnce(&mut BufferedRequests) -> R,
        forward: impl FnOnce(&dyn ExecutionContext) -> R,
    ) -> R {
        let context = {
            let mut state = self.state.lock();
            match &mut *state {
                HandleState::Initial(requests) => return buffer(requests),
                HandleState::Bound(context) => Arc::clone(context),
            }
        };
        forward(&*context)
    }

    /// Proxy for [`ExecutionContext::wake_up_now`].
    pub fn wake_up_now(&self) {
        self.dispatch(
            |requests| requests.wake_requested = true,
            |context| ExecutionContext::wake_up_now(context),
        );
    }

    /// Proxy for [`ExecutionContext::schedule_next_wake_up`].
    pub fn schedule_next_wake_up(&self, after: Duration) {
        self.dispatch(
            |requests| requests.scheduled_wake_up = Some(Instant::now() + after),
            |context| context.schedule_next_wake_up(after),
        );
    }

    /// Proxy for [`ExecutionContext::unschedule_next_wake_up`].
    pub fn unschedule_next_wake_up(&self) {
        self.dispatch(
            |requests| requests.scheduled_wake_up = None,
            |context| ExecutionContext::unschedule_next_wake_up(context),
        );
    }

    /// Proxy for [`ExecutionContext::stop`].
    pub fn stop(&self) {
        self.dispatch(|requests| requests.stopped = true, |context| {
            ExecutionContext::stop(context)
        });
    }

    /// Proxy for [`ExecutionContext::running`].
    #[must_use]
    pub fn running(&self) -> bool {
        self.dispatch(|requests| !requests.stopped, |context| {
            ExecutionContext::running(context)
        })
    }
}

impl Default for ContextHandle {
    fn default() -> Self {
        Self::new()
    }
}
