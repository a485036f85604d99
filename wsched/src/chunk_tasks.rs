//! Per-chunk task bookkeeping.

use crate::SlowTableHeap;
use data_types::ChunkId;
use memman::MemMan;
use observability_deps::tracing::{debug, warn};
use std::{collections::HashSet, sync::Arc};
use wbase::{Task, TaskId};

/// Outcome of a readiness check on one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// A task has its memory reserved and can be handed to an executor.
    Ready,
    /// Nothing to run right now (queue empty or everything in flight).
    NotReady,
    /// The next task's tables do not fit in memory. The caller must not
    /// advance past this chunk.
    NoResources,
}

/// Tasks for one chunk.
///
/// Arrivals normally go on the active heap; while this chunk is the queue's
/// active chunk they are buffered on the pending list instead, so that late
/// arrivals cannot stall the cursor on one chunk forever. A task whose
/// memory has been locked sits in the ready slot until an executor collects
/// it, then moves to the in-flight set until completion.
#[derive(Debug)]
pub struct ChunkTasks {
    chunk_id: ChunkId,
    active: bool,
    resource_starved: bool,
    ready_task: Option<Arc<Task>>,
    active_tasks: SlowTableHeap,
    pending_tasks: Vec<Arc<Task>>,
    in_flight: HashSet<TaskId>,
    mem_man: Arc<dyn MemMan>,
}

impl ChunkTasks {
    /// Create an empty container for `chunk_id`.
    pub fn new(chunk_id: ChunkId, mem_man: Arc<dyn MemMan>) -> Self {
        Self {
            chunk_id,
            active: false,
            resource_starved: false,
            ready_task: None,
            active_tasks: SlowTableHeap::new(),
            pending_tasks: Vec::new(),
            in_flight: HashSet::new(),
            mem_man,
        }
    }

    /// The chunk all tasks in this container target.
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Queue a task. Goes to pending while this is the active chunk.
    pub fn queue_task(&mut self, task: Arc<Task>) {
        if self.active {
            debug!(%task, "queued on pending; chunk is active");
            self.pending_tasks.push(task);
        } else {
            self.active_tasks.push(task);
        }
    }

    /// Try to make the slowest queued task runnable by reserving its tables.
    ///
    /// Tasks the memory manager rejects permanently are removed from the
    /// queue and appended to `failed`; the caller disposes of them once it
    /// has released its lock.
    pub fn ready(&mut self, use_flexible_lock: bool, failed: &mut Vec<Arc<Task>>) -> ReadyState {
        if self.ready_task.is_some() {
            return ReadyState::Ready;
        }
        loop {
            let candidate = match self.active_tasks.top() {
                None => return ReadyState::NotReady,
                Some(t) => Arc::clone(t),
            };
            match self.mem_man.reserve(
                candidate.scan_info().tables(),
                self.chunk_id,
                use_flexible_lock,
            ) {
                Ok(reservation) => {
                    self.resource_starved = false;
                    debug!(%candidate, id = %reservation.id(), "memory reserved");
                    candidate.attach_reservation(reservation);
                    self.active_tasks.pop();
                    self.ready_task = Some(candidate);
                    return ReadyState::Ready;
                }
                Err(e) if e.is_permanent() => {
                    warn!(%candidate, %e, "dropping task; reservation failed permanently");
                    self.active_tasks.pop();
                    failed.push(candidate);
                }
                Err(e) => {
                    debug!(chunk_id = %self.chunk_id, %e, "chunk is resource starved");
                    self.resource_starved = true;
                    return ReadyState::NoResources;
                }
            }
        }
    }

    /// Hand over the ready task and track it as in flight. Returns `None`
    /// without side effect when no task can be made ready.
    pub fn get_task(
        &mut self,
        use_flexible_lock: bool,
        failed: &mut Vec<Arc<Task>>,
    ) -> Option<Arc<Task>> {
        if self.ready(use_flexible_lock, failed) != ReadyState::Ready {
            return None;
        }
        let task = self.ready_task.take()?;
        self.in_flight.insert(task.tid());
        Some(task)
    }

    /// Mark a task finished and release its memory reservation. Returns
    /// whether the task was tracked here.
    pub fn task_complete(&mut self, task: &Task) -> bool {
        let found = self.in_flight.remove(&task.tid());
        if !found {
            warn!(%task, chunk_id = %self.chunk_id, "completed task was not in flight");
        }
        if let Some(reservation) = task.take_reservation() {
            self.mem_man.release(reservation);
        }
        found
    }

    /// Drain the pending list into the active heap.
    pub fn move_pending_to_active(&mut self) {
        for task in self.pending_tasks.drain(..) {
            self.active_tasks.push(task);
        }
    }

    /// Whether the queue cursor may move past this chunk: every started or
    /// startable task is done. Pending tasks do not hold the cursor here;
    /// they join the heap when the chunk deactivates and run on a later
    /// pass.
    pub fn ready_to_advance(&self) -> bool {
        self.in_flight.is_empty() && self.active_tasks.is_empty() && self.ready_task.is_none()
    }

    /// Toggle the active-chunk flag. Deactivation drains pending arrivals
    /// into the active heap.
    pub fn set_active(&mut self, active: bool) {
        if self.active && !active {
            self.move_pending_to_active();
        }
        self.active = active;
    }

    /// Whether this is currently the active chunk.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record starvation and return the previous value.
    pub fn set_resource_starved(&mut self, starved: bool) -> bool {
        std::mem::replace(&mut self.resource_starved, starved)
    }

    /// Whether the last readiness check failed on memory.
    pub fn is_resource_starved(&self) -> bool {
        self.resource_starved
    }

    /// Number of tasks waiting to run (heap plus pending).
    pub fn size(&self) -> usize {
        self.active_tasks.len() + self.pending_tasks.len()
    }

    /// Whether any task of this chunk is executing.
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Whether a task holds the ready slot.
    pub fn has_ready_task(&self) -> bool {
        self.ready_task.is_some()
    }

    /// Whether nothing at all is tracked here.
    pub fn is_empty(&self) -> bool {
        self.active_tasks.is_empty()
            && self.pending_tasks.is_empty()
            && self.in_flight.is_empty()
            && self.ready_task.is_none()
    }

    /// Remove a task that has not been handed to an executor yet. Removing
    /// the ready task releases its reservation. In-flight tasks cannot be
    /// removed; cancellation must run its course instead.
    pub fn remove_task(&mut self, task: &Task) -> Option<Arc<Task>> {
        if let Some(t) = self.active_tasks.remove(task.tid()) {
            return Some(t);
        }
        if let Some(pos) = self
            .pending_tasks
            .iter()
            .position(|t| t.tid() == task.tid())
        {
            return Some(self.pending_tasks.remove(pos));
        }
        if self.ready_task.as_ref().map(|t| t.tid()) == Some(task.tid()) {
            let t = self.ready_task.take()?;
            if let Some(reservation) = t.take_reservation() {
                self.mem_man.release(reservation);
            }
            return Some(t);
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn tracked_tasks(&self) -> usize {
        self.active_tasks.len()
            + self.pending_tasks.len()
            + self.in_flight.len()
            + usize::from(self.ready_task.is_some())
    }
}
