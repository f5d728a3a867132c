//! Example: a task executor driven by its own worker thread.

use std::sync::Arc;
use std::time::Duration;

use strand::{SingleThreadExecution, TaskExecutor};

fn main() {
    let executor = Arc::new(TaskExecutor::new());
    executor.set_finish_tasks_on_exit(true);

    let mut execution = SingleThreadExecution::new(executor.clone());
    execution.launch_thread(Some("worker"));

    executor.push_task(|| println!("immediate task"));
    executor.schedule_task(Duration::from_millis(50), || {
        println!("timed task, ~50 ms later");
    });

    // Rescheduling moves a pending timed task to a new deadline.
    let id = executor.schedule_task(Duration::from_millis(200), || {
        println!("rescheduled task, ~100 ms later");
    });
    executor.reschedule_task(Duration::from_millis(100), id);

    std::thread::sleep(Duration::from_millis(150));
    execution.stop_and_join_thread();
    println!("done");
}
