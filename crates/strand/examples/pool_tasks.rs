//! Example: several task executors sharing a worker pool, with bulk
//! cancellation by token.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand::{CancelToken, PoolExecution, TaskExecutor};

fn main() {
    let pool = PoolExecution::new();
    pool.launch_threads(4, Some("pool"));

    let executors: Vec<Arc<TaskExecutor>> =
        (0..3).map(|_| Arc::new(TaskExecutor::new())).collect();
    for executor in &executors {
        pool.add_executor(executor.clone());
    }

    let completed = Arc::new(AtomicU32::new(0));
    let noise = CancelToken::new(1);

    for executor in &executors {
        let mut locker = executor.task_locker();
        for _ in 0..100 {
            let completed = Arc::clone(&completed);
            locker.push_task(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..10 {
            locker.push_task_with(|| println!("noise"), noise, CancelToken::NONE);
        }
        // Still under the same critical section, so none of the noise tasks
        // can have started yet: all ten are cancelled.
        let cancelled = locker.cancel_tasks_with_token(noise);
        println!("cancelled {cancelled} noise tasks");
    }

    std::thread::sleep(Duration::from_millis(100));
    pool.stop_and_join_threads();

    println!("completed {} tasks", completed.load(Ordering::SeqCst));
}
