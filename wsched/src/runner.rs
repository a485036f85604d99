//! The executor pool that drains a [`ScanScheduler`].

use crate::ScanScheduler;
use observability_deps::tracing::{debug, info, warn};
use snafu::Snafu;
use std::{fmt, sync::Arc, thread::JoinHandle};
use wbase::Task;

/// Query execution failure, reported to the coordinator as a terminal
/// error reply.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum RunnerError {
    #[snafu(display("query execution failed: {}", message))]
    Execution { message: String },
}

/// Executes one task's SQL fragments and streams the results through the
/// task's reply sink.
///
/// Implementations must check [`Task::is_cancelled`] between fragments and
/// between result-streaming chunks, and must make the terminal reply call
/// themselves on success.
pub trait QueryRunner: Send + Sync + fmt::Debug {
    /// Run every fragment of `task`, streaming results as they appear.
    fn run(&self, task: &Task) -> Result<(), RunnerError>;
}

/// A fixed pool of executor threads feeding off one scheduler.
///
/// Every task handed out by the scheduler reaches `task_complete`, whether
/// it ran, failed, or was cancelled before it started; that is what releases
/// its memory reservation.
#[derive(Debug)]
pub struct RunnerPool {
    scheduler: Arc<ScanScheduler>,
    handles: Vec<JoinHandle<()>>,
}

impl RunnerPool {
    /// Spawn `threads` executor threads.
    pub fn new(
        scheduler: Arc<ScanScheduler>,
        runner: Arc<dyn QueryRunner>,
        threads: usize,
    ) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let scheduler = Arc::clone(&scheduler);
            let runner = Arc::clone(&runner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-runner-{}", scheduler.name(), i))
                .spawn(move || worker_loop(&scheduler, runner.as_ref()))?;
            handles.push(handle);
        }
        Ok(Self { scheduler, handles })
    }

    /// Stop the scheduler and wait for every executor thread to exit.
    pub fn shutdown(mut self) {
        self.scheduler.shutdown();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("executor thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(scheduler: &ScanScheduler, runner: &dyn QueryRunner) {
    info!(scheduler = %scheduler.name(), "executor thread started");
    while let Some(task) = scheduler.wait_task() {
        if task.is_cancelled() {
            // Cancellation raced task delivery; short-circuit but still
            // complete so the reservation is released.
            debug!(%task, "delivered task was already cancelled");
            task.send_channel().send_error("query cancelled", 499);
        } else if let Err(e) = runner.run(&task) {
            warn!(%task, %e, "query execution failed");
            task.send_channel().send_error(&e.to_string(), 500);
        }
        scheduler.task_complete(&task);
    }
    info!(scheduler = %scheduler.name(), "executor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerConfig;
    use data_types::{ChunkId, Priority, ScanInfo, ScanTable};
    use memman::{MemMan, MockMemMan};
    use parking_lot::Mutex;
    use std::time::Duration;
    use test_helpers::wait_for_condition;
    use wbase::{BufferChannel, SendChannel, TaskId};

    /// Records what it ran and echoes the first fragment as the result.
    #[derive(Debug, Default)]
    struct RecordingRunner {
        ran: Mutex<Vec<TaskId>>,
    }

    impl QueryRunner for RecordingRunner {
        fn run(&self, task: &Task) -> Result<(), RunnerError> {
            self.ran.lock().push(task.tid());
            let reply = task.fragments()[0].as_bytes();
            task.send_channel().send_stream(reply, true);
            Ok(())
        }
    }

    fn task(channel: Arc<dyn SendChannel>, chunk: u32, slowness: i32) -> Arc<Task> {
        Task::new(
            "qid",
            "LSST",
            ChunkId::new(chunk),
            vec![format!("SELECT {}", slowness)],
            ScanInfo::new(vec![ScanTable::new("LSST", "Object", slowness)]),
            Priority::Medium,
            channel,
        )
        .unwrap()
    }

    #[test]
    fn pool_drains_the_scheduler() {
        test_helpers::maybe_start_logging();
        let mm = Arc::new(MockMemMan::new());
        let scheduler = Arc::new(ScanScheduler::new(
            "scan",
            Arc::clone(&mm) as Arc<dyn MemMan>,
            SchedulerConfig::default(),
        ));
        let runner = Arc::new(RecordingRunner::default());
        let pool = RunnerPool::new(
            Arc::clone(&scheduler),
            Arc::clone(&runner) as Arc<dyn QueryRunner>,
            2,
        )
        .unwrap();

        let channel = BufferChannel::new();
        let mut queued = vec![];
        for (chunk, slowness) in [(42, 10), (42, 5), (43, 7)] {
            let t = task(Arc::clone(&channel) as Arc<dyn SendChannel>, chunk, slowness);
            queued.push(t.tid());
            scheduler.queue_task(t);
        }

        wait_for_condition("all queued tasks ran to completion", Duration::from_secs(10), || {
            runner.ran.lock().len() == queued.len()
                && scheduler.task_count() == 0
                && mm.outstanding() == 0
        });
        pool.shutdown();

        let mut ran = runner.ran.lock().clone();
        ran.sort();
        let mut expected = queued;
        expected.sort();
        assert_eq!(ran, expected);
        assert!(!channel.contents().is_empty());
    }

    #[test]
    fn cancelled_tasks_short_circuit_with_an_error_reply() {
        test_helpers::maybe_start_logging();
        let mm = Arc::new(MockMemMan::new());
        let scheduler = Arc::new(ScanScheduler::new(
            "scan",
            Arc::clone(&mm) as Arc<dyn MemMan>,
            SchedulerConfig::default(),
        ));
        let runner = Arc::new(RecordingRunner::default());
        let pool = RunnerPool::new(
            Arc::clone(&scheduler),
            Arc::clone(&runner) as Arc<dyn QueryRunner>,
            1,
        )
        .unwrap();

        let channel = BufferChannel::new();
        let t = task(Arc::clone(&channel) as Arc<dyn SendChannel>, 42, 10);
        // Cancelled before it is even queued: delivery still happens, the
        // executor short-circuits, and completion releases the reservation.
        t.cancel();
        scheduler.queue_task(Arc::clone(&t));

        wait_for_condition("cancelled task was failed and released", Duration::from_secs(10), || {
            !channel.errors().is_empty() && mm.outstanding() == 0
        });
        pool.shutdown();

        assert!(runner.ran.lock().is_empty());
        assert_eq!(channel.errors()[0].0, 499);
        assert_eq!(scheduler.task_count(), 0);
    }
}
