//! Executors and execution contexts.
//!
//! `strand` separates *what runs* — an [`Executor`], a unit of repeatable
//! work with `update()` and `finalize()` — from *where and when it runs* —
//! an [`ExecutionContext`], the scheduling side that turns wake-up requests
//! into `update()` calls. Three executions are provided:
//!
//! - [`SingleThreadExecution`] owns one worker thread driving one executor
//!   (and [`LocalExecution`] runs the same loop on the calling thread),
//! - [`PoolExecution`] multiplexes many executors onto a bounded worker
//!   set while keeping each executor strictly serialized,
//! - [`TaskExecutor`] is a ready-made executor delivering an immediate
//!   closure queue plus a deadline-ordered timed queue, with cancellation
//!   by id or by token.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use strand::{SingleThreadExecution, TaskExecutor};
//!
//! let executor = Arc::new(TaskExecutor::new());
//! executor.set_finish_tasks_on_exit(true);
//!
//! let mut execution = SingleThreadExecution::new(executor.clone());
//! execution.launch_thread(Some("worker"));
//!
//! let counter = Arc::new(AtomicU32::new(0));
//! let task_counter = counter.clone();
//! executor.push_task(move || {
//!     task_counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! execution.stop_and_join_thread();
//! assert_eq!(counter.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Wake-up contract
//!
//! Producers may call `wake_up_now`, `schedule_next_wake_up` and `stop`
//! from any thread. Redundant wake-ups collapse into at most one pending
//! dispatch; a new schedule overrides an older one; an immediate wake-up
//! makes a pending schedule forgotten; `stop` is monotonic and is followed
//! by exactly one `finalize`. All deadlines are measured on the monotonic
//! clock.

#![warn(missing_docs)]

mod context;
mod executor;
mod ordered_set;
mod pool;
mod task_executor;
mod thread_execution;
mod timed_queue;

pub use context::{ContextHandle, ExecutionContext, NoopExecutionContext};
pub use executor::Executor;
pub use pool::{PoolConfig, PoolExecution};
pub use task_executor::{
    CancelToken, TaskExecutor, TaskId, TaskLocker, DEFAULT_MIN_TIME_TO_SCHEDULE,
};
pub use thread_execution::{LocalExecution, SingleThreadExecution, ThreadExecutionContext};

pub use strand_thread_name as thread_name;
