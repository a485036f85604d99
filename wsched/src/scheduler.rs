//! The scheduler instance dispatch sessions hand their tasks to.

use crate::ChunkTasksQueue;
use data_types::ChunkId;
use memman::MemMan;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use wbase::Task;

/// How long a waiting executor sleeps between queue checks when no wakeup
/// arrives. A backstop only; completions and arrivals notify explicitly.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Scheduler tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Cap on concurrent chunks with in-flight tasks.
    pub max_active_chunks: usize,
    /// Whether `get_task` reserves memory with the flexible lock mode.
    pub flexible_lock_by_default: bool,
    /// Apply `max_active_chunks` to the active-cursor chunk as well. Off by
    /// default: the active chunk is exempt so it can always progress.
    pub enforce_active_chunk_cap: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_chunks: 2,
            flexible_lock_by_default: false,
            enforce_active_chunk_cap: false,
        }
    }
}

/// A shared-scan scheduler: one [`ChunkTasksQueue`] behind one mutex, plus
/// the wakeup machinery executor threads block on.
///
/// All queue state is manipulated with the mutex held; reply-sink and other
/// user callbacks are only ever invoked after the lock is released.
#[derive(Debug)]
pub struct ScanScheduler {
    name: String,
    config: SchedulerConfig,
    queue: Mutex<ChunkTasksQueue>,
    work_available: Condvar,
    shutdown: AtomicBool,
}

impl ScanScheduler {
    /// Create a scheduler around `mem_man`.
    pub fn new(name: impl Into<String>, mem_man: Arc<dyn MemMan>, config: SchedulerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            queue: Mutex::new(ChunkTasksQueue::new(
                mem_man,
                config.max_active_chunks,
                config.enforce_active_chunk_cap,
            )),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// The scheduler's name, used in logs and thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Accept a task for scheduling.
    pub fn queue_task(&self, task: Arc<Task>) {
        debug!(scheduler = %self.name, %task, "task queued");
        self.queue.lock().queue_task(task);
        self.work_available.notify_one();
    }

    /// Whether a task could be provided right now.
    pub fn ready(&self) -> bool {
        let flexible = self.config.flexible_lock_by_default;
        let (ready, failed) = {
            let mut queue = self.queue.lock();
            (queue.ready(flexible), queue.take_failed())
        };
        self.dispose_failed(failed);
        ready
    }

    /// Take the next runnable task, or `None` when nothing is ready.
    pub fn get_task(&self) -> Option<Arc<Task>> {
        self.get_task_flexible(self.config.flexible_lock_by_default)
    }

    /// Take the next runnable task using an explicit lock mode.
    pub fn get_task_flexible(&self, use_flexible_lock: bool) -> Option<Arc<Task>> {
        let (task, failed) = {
            let mut queue = self.queue.lock();
            (queue.get_task(use_flexible_lock), queue.take_failed())
        };
        self.dispose_failed(failed);
        task
    }

    /// Block until a task is runnable or the scheduler shuts down.
    pub fn wait_task(&self) -> Option<Arc<Task>> {
        let flexible = self.config.flexible_lock_by_default;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            let (task, failed) = {
                let mut queue = self.queue.lock();
                let task = queue.get_task(flexible);
                let failed = queue.take_failed();
                if task.is_none() && failed.is_empty() {
                    self.work_available.wait_for(&mut queue, WAIT_POLL);
                    continue;
                }
                (task, failed)
            };
            self.dispose_failed(failed);
            if let Some(task) = task {
                return Some(task);
            }
        }
    }

    /// Report a finished task: its reservation is released and executors
    /// waiting on memory or on cursor advancement are woken.
    pub fn task_complete(&self, task: &Task) {
        let found = self.queue.lock().task_complete(task);
        if !found {
            warn!(scheduler = %self.name, %task, "completion for untracked task");
        }
        self.work_available.notify_all();
    }

    /// Cancel a task and, if it has not started, drop it from the queue.
    ///
    /// Returns the removed task when it never reached an executor; the
    /// caller owes its reply sink a terminal error. Returns `None` for
    /// in-flight tasks, which finish through the normal completion path.
    pub fn cancel_task(&self, task: &Task) -> Option<Arc<Task>> {
        task.cancel();
        let removed = self.queue.lock().remove_task(task);
        if removed.is_some() {
            self.work_available.notify_all();
        }
        removed
    }

    /// Total tasks tracked by the queue.
    pub fn task_count(&self) -> usize {
        self.queue.lock().task_count()
    }

    /// The chunk currently favored by the cursor.
    pub fn active_chunk_id(&self) -> Option<ChunkId> {
        self.queue.lock().active_chunk_id()
    }

    /// Whether the last sweep stopped on memory starvation.
    pub fn is_resource_starved(&self) -> bool {
        self.queue.lock().is_resource_starved()
    }

    /// Whether the next task will come from a different chunk.
    pub fn next_task_different_chunk_id(&self) -> bool {
        self.queue.lock().next_task_different_chunk_id()
    }

    /// Stop providing tasks and wake every waiting executor.
    pub fn shutdown(&self) {
        info!(scheduler = %self.name, "scheduler shutting down");
        self.shutdown.store(true, Ordering::Relaxed);
        self.work_available.notify_all();
    }

    /// Whether [`ScanScheduler::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Fail tasks the memory manager rejected permanently. Called with the
    /// queue lock released: this walks user reply sinks.
    fn dispose_failed(&self, failed: Vec<Arc<Task>>) {
        for task in failed {
            warn!(scheduler = %self.name, %task, "failing task; memory cannot be reserved");
            task.cancel();
            task.send_channel()
                .send_error("memory reservation failed permanently", 503);
        }
    }
}
