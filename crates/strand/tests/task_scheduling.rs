//! Timed-task scheduling scenarios: coalescing, ordering, rescheduling and
//! shutdown draining.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use strand::{SingleThreadExecution, TaskExecutor};

fn launch(executor: &Arc<TaskExecutor>) -> SingleThreadExecution {
    let mut execution = SingleThreadExecution::new(executor.clone());
    execution.launch_thread(Some("task-sched"));
    execution
}

// ============================================================================
// Stopping early: due work runs, distant work is discarded
// ============================================================================

#[test]
fn shutdown_runs_due_tasks_and_discards_distant_ones() {
    let executor = Arc::new(TaskExecutor::new());
    executor.set_finish_tasks_on_exit(true);
    let mut execution = launch(&executor);

    let immediate = Arc::new(AtomicU32::new(0));
    let near = Arc::new(AtomicU32::new(0));
    let distant = Arc::new(AtomicU32::new(0));

    {
        let mut locker = executor.task_locker();
        let immediate = Arc::clone(&immediate);
        locker.push_task(move || {
            immediate.fetch_add(1, Ordering::SeqCst);
        });
        // Below the coalescing window: becomes an immediate task.
        let near = Arc::clone(&near);
        locker.schedule_task(Duration::from_millis(1), move || {
            near.fetch_add(1, Ordering::SeqCst);
        });
        let distant = Arc::clone(&distant);
        locker.schedule_task(Duration::from_secs(100), move || {
            distant.fetch_add(1, Ordering::SeqCst);
        });
    }

    execution.stop_and_join_thread();

    assert_eq!(immediate.load(Ordering::SeqCst), 1);
    assert_eq!(near.load(Ordering::SeqCst), 1);
    assert_eq!(distant.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Deadline ordering across an update tick
// ============================================================================

#[test]
fn timed_tasks_run_in_deadline_order() {
    let executor = Arc::new(TaskExecutor::new());
    executor.set_finish_tasks_on_exit(true);
    let mut execution = launch(&executor);

    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicU32::new(0));

    {
        let mut locker = executor.task_locker();
        let order_first = Arc::clone(&order);
        let order_middle = Arc::clone(&order);
        let order_last = Arc::clone(&order);
        let done = Arc::clone(&done);

        locker.schedule_task(Duration::from_millis(80), move || {
            order_last.lock().unwrap().push("last");
            done.fetch_add(1, Ordering::SeqCst);
        });
        locker.schedule_task(Duration::from_millis(55), move || {
            order_middle.lock().unwrap().push("middle");
        });
        locker.schedule_task(Duration::from_millis(30), move || {
            order_first.lock().unwrap().push("first");
        });
    }

    while done.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    execution.stop_and_join_thread();

    assert_eq!(*order.lock().unwrap(), vec!["first", "middle", "last"]);
}

// ============================================================================
// Rescheduling pushes a task behind a later peer
// ============================================================================

#[test]
fn rescheduled_task_runs_after_its_original_peer() {
    let executor = Arc::new(TaskExecutor::new());
    executor.set_finish_tasks_on_exit(true);
    let mut execution = launch(&executor);

    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicU32::new(0));

    {
        let mut locker = executor.task_locker();
        let order_x = Arc::clone(&order);
        let order_y = Arc::clone(&order);
        let done = Arc::clone(&done);

        let x = locker.schedule_task(Duration::from_millis(30), move || {
            order_x.lock().unwrap().push("x");
            done.fetch_add(1, Ordering::SeqCst);
        });
        locker.schedule_task(Duration::from_millis(50), move || {
            order_y.lock().unwrap().push("y");
        });

        assert!(locker.reschedule_task(Duration::from_millis(60), x));
    }

    while done.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    execution.stop_and_join_thread();

    assert_eq!(*order.lock().unwrap(), vec!["y", "x"]);
}

// ============================================================================
// Reschedule produces exactly one execution, at the new deadline
// ============================================================================

#[test]
fn reschedule_moves_the_single_execution() {
    let executor = Arc::new(TaskExecutor::new());
    let mut execution = launch(&executor);

    let runs = Arc::new(AtomicU32::new(0));
    let scheduled_at = Instant::now();
    let ran_after = Arc::new(Mutex::new(None));

    let id = {
        let runs = Arc::clone(&runs);
        let ran_after = Arc::clone(&ran_after);
        executor.schedule_task(Duration::from_millis(60), move || {
            runs.fetch_add(1, Ordering::SeqCst);
            *ran_after.lock().unwrap() = Some(scheduled_at.elapsed());
        })
    };
    assert!(executor.reschedule_task(Duration::from_millis(200), id));

    while runs.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(5));
    }
    execution.stop_and_join_thread();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let elapsed = ran_after.lock().unwrap().expect("task ran");
    // The coalescing window may promote the task slightly early, but never
    // anywhere near the original deadline.
    assert!(elapsed >= Duration::from_millis(170), "ran after {elapsed:?}");
}

// ============================================================================
// A timed task never fires early
// ============================================================================

#[test]
fn timed_task_respects_its_deadline() {
    let executor = Arc::new(TaskExecutor::new());
    let mut execution = launch(&executor);

    let ran_after = Arc::new(Mutex::new(None));
    let scheduled_at = Instant::now();

    {
        let ran_after = Arc::clone(&ran_after);
        executor.schedule_task(Duration::from_millis(60), move || {
            *ran_after.lock().unwrap() = Some(scheduled_at.elapsed());
        });
    }

    while ran_after.lock().unwrap().is_none() {
        thread::sleep(Duration::from_millis(5));
    }
    execution.stop_and_join_thread();

    let elapsed = ran_after.lock().unwrap().expect("task ran");
    // Promotion happens at most one coalescing window before the deadline.
    assert!(elapsed >= Duration::from_millis(39), "ran after {elapsed:?}");
}
