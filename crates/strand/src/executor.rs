//! The executor contract: a unit of repeatable work.

use std::time::Duration;

use crate::context::ContextHandle;

/// A unit of repeatable work driven by an execution.
///
/// Implementations own a [`ContextHandle`] and expose it through
/// [`Executor::context`]; executions bind their context through it when the
/// executor is attached. The provided methods proxy the wake-up surface so
/// that producers can talk to the executor directly.
///
/// `update` is never entered concurrently for one executor — every execution
/// in this crate serializes it — but it may run on different threads over
/// time, hence the `Send + Sync` bound.
pub trait Executor: Send + Sync {
    /// The handle through which this executor reaches its context.
    fn context(&self) -> &ContextHandle;

    /// Perform pending work. Called by the driving execution, one call at a
    /// time per executor.
    fn update(&self);

    /// Terminate gracefully. Called exactly once, after the final `update`.
    fn finalize(&self) {}

    /// Proxy for [`ContextHandle::wake_up_now`].
    fn wake_up_now(&self) {
        self.context().wake_up_now();
    }

    /// Proxy for [`ContextHandle::schedule_next_wake_up`].
    fn schedule_next_wake_up(&self, after: Duration) {
        self.context().schedule_next_wake_up(after);
    }

    /// Proxy for [`ContextHandle::unschedule_next_wake_up`].
    fn unschedule_next_wake_up(&self) {
        self.context().unschedule_next_wake_up();
    }

    /// Proxy for [`ContextHandle::stop`].
    fn stop(&self) {
        self.context().stop();
    }

    /// Proxy for [`ContextHandle::running`].
    fn running(&self) -> bool {
        self.context().running()
    }
}
