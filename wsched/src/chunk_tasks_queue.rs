//! The queue of chunks the scheduler sweeps for runnable work.

use crate::{ChunkTasks, ReadyState};
use data_types::ChunkId;
use memman::MemMan;
use observability_deps::tracing::{debug, error, info};
use std::{collections::BTreeMap, ops::Bound, sync::Arc};
use wbase::Task;

/// Tasks grouped by chunk id, swept in id order by an active-chunk cursor.
///
/// The active chunk keeps providing tasks until everything started on it has
/// finished; only then does the cursor advance to the next chunk id,
/// wrapping at the end of the map. While the active chunk still has work in
/// flight, chunks behind the cursor may be dispatched opportunistically, up
/// to the `max_active_chunks` ceiling. A chunk reporting `NoResources` stops
/// the sweep outright: skipping past a starved chunk would let the queue
/// run arbitrarily far ahead of it and livelock under memory pressure.
#[derive(Debug)]
pub struct ChunkTasksQueue {
    chunk_map: BTreeMap<ChunkId, ChunkTasks>,
    active_chunk: Option<ChunkId>,
    ready_chunk: Option<ChunkId>,
    task_count: usize,
    resource_starved: bool,
    mem_man: Arc<dyn MemMan>,
    max_active_chunks: usize,
    enforce_active_chunk_cap: bool,
    failed: Vec<Arc<Task>>,
}

impl ChunkTasksQueue {
    /// Create an empty queue.
    ///
    /// `max_active_chunks` caps how many chunks may have tasks executing at
    /// once before the sweep stops starting work on further chunks. The
    /// active-cursor chunk is exempt from the cap unless
    /// `enforce_active_chunk_cap` is set.
    pub fn new(
        mem_man: Arc<dyn MemMan>,
        max_active_chunks: usize,
        enforce_active_chunk_cap: bool,
    ) -> Self {
        Self {
            chunk_map: BTreeMap::new(),
            active_chunk: None,
            ready_chunk: None,
            task_count: 0,
            resource_starved: false,
            mem_man,
            max_active_chunks,
            enforce_active_chunk_cap,
            failed: Vec::new(),
        }
    }

    /// Queue a task with the other tasks targeting the same chunk.
    pub fn queue_task(&mut self, task: Arc<Task>) {
        let chunk_id = task.chunk_id();
        let chunk = self.chunk_map.entry(chunk_id).or_insert_with(|| {
            debug!(%chunk_id, "new chunk entry");
            ChunkTasks::new(chunk_id, Arc::clone(&self.mem_man))
        });
        self.task_count += 1;
        chunk.queue_task(task);
    }

    /// Whether a call to [`ChunkTasksQueue::get_task`] would yield a task.
    ///
    /// On success the providing chunk is remembered, so the follow-up
    /// `get_task` is cheap and returns the same task.
    pub fn ready(&mut self, use_flexible_lock: bool) -> bool {
        if self.ready_chunk.is_some() {
            return true;
        }
        if self.chunk_map.is_empty() {
            return false;
        }

        // If the cursor is invalid, start at the beginning; arrivals for the
        // new active chunk divert to its pending list from here on.
        let mut active = match self.active_chunk.filter(|id| self.chunk_map.contains_key(id)) {
            Some(id) => id,
            None => {
                let Some(first) = self.first_chunk() else {
                    return false;
                };
                if let Some(ct) = self.chunk_map.get_mut(&first) {
                    ct.set_active(true);
                }
                info!(chunk_id = %first, "active chunk established");
                self.active_chunk = Some(first);
                first
            }
        };

        if self.enforce_active_chunk_cap && self.cap_blocks(active) {
            return false;
        }

        // Check the active chunk for a runnable task.
        if self.chunk_ready(active, use_flexible_lock) == ReadyState::Ready {
            self.ready_chunk = Some(active);
            return true;
        }

        // Advance the cursor once everything started on the active chunk
        // has completed.
        if self.chunk_ready_to_advance(active) {
            let next = self.next_chunk(active);
            let erase = match self.chunk_map.get_mut(&active) {
                Some(ct) => {
                    ct.set_active(false);
                    ct.is_empty()
                }
                None => false,
            };
            let new_active = if erase {
                debug!(chunk_id = %active, "chunk drained; removing");
                self.chunk_map.remove(&active);
                (next != active).then_some(next)
            } else {
                Some(next)
            };
            self.active_chunk = new_active;
            let Some(a) = new_active else {
                return false;
            };
            if let Some(ct) = self.chunk_map.get_mut(&a) {
                ct.move_pending_to_active();
                ct.set_active(true);
            }
            info!(chunk_id = %a, "active chunk advanced");
            active = a;
        }

        // Sweep forward from the active chunk until a chunk is ready, a
        // chunk is starved, or the whole map has been checked.
        let mut iter = active;
        loop {
            match self.chunk_ready(iter, use_flexible_lock) {
                ReadyState::Ready => {
                    self.resource_starved = false;
                    self.ready_chunk = Some(iter);
                    return true;
                }
                ReadyState::NoResources => {
                    // Advancing past a starved chunk would break fairness.
                    self.resource_starved = true;
                    return false;
                }
                ReadyState::NotReady => {}
            }
            iter = self.next_chunk(iter);
            if iter == active {
                return false;
            }
            if self.cap_blocks(iter) {
                return false;
            }
        }
    }

    /// Take the next runnable task, if any.
    pub fn get_task(&mut self, use_flexible_lock: bool) -> Option<Arc<Task>> {
        self.ready(use_flexible_lock);
        let chunk_id = self.ready_chunk.take()?;
        let Self {
            chunk_map,
            failed,
            task_count,
            ..
        } = self;
        let before = failed.len();
        let task = chunk_map
            .get_mut(&chunk_id)
            .and_then(|ct| ct.get_task(use_flexible_lock, failed));
        *task_count -= failed.len() - before;
        if task.is_some() {
            self.task_count -= 1;
        }
        task
    }

    /// Forward a completion to the owning chunk. Returns whether the task
    /// was tracked.
    pub fn task_complete(&mut self, task: &Task) -> bool {
        match self.chunk_map.get_mut(&task.chunk_id()) {
            Some(ct) => ct.task_complete(task),
            None => {
                error!(%task, "no chunk entry for completed task");
                false
            }
        }
    }

    /// Remove a task that has not started executing. Returns the removed
    /// task, or `None` when it is unknown or already in flight.
    pub fn remove_task(&mut self, task: &Task) -> Option<Arc<Task>> {
        let chunk_id = task.chunk_id();
        let removed = self.chunk_map.get_mut(&chunk_id)?.remove_task(task);
        if removed.is_some() {
            self.task_count -= 1;
            let ready_gone = self
                .chunk_map
                .get(&chunk_id)
                .map(|ct| !ct.has_ready_task())
                .unwrap_or(true);
            if self.ready_chunk == Some(chunk_id) && ready_gone {
                self.ready_chunk = None;
            }
        }
        removed
    }

    /// Hint for priority rebalancing: `true` when the next task will come
    /// from a different chunk than the last one.
    pub fn next_task_different_chunk_id(&self) -> bool {
        match self.active_chunk {
            None => true,
            Some(id) => self.chunk_ready_to_advance(id),
        }
    }

    /// Record queue-wide starvation; returns the previous value.
    pub fn set_resource_starved(&mut self, starved: bool) -> bool {
        std::mem::replace(&mut self.resource_starved, starved)
    }

    /// Whether the last sweep stopped on a starved chunk.
    pub fn is_resource_starved(&self) -> bool {
        self.resource_starved
    }

    /// The chunk the cursor currently favors.
    pub fn active_chunk_id(&self) -> Option<ChunkId> {
        self.active_chunk.filter(|id| self.chunk_map.contains_key(id))
    }

    /// Total tasks tracked, including ready and in-flight ones.
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Whether no chunk entries exist.
    pub fn is_empty(&self) -> bool {
        self.chunk_map.is_empty()
    }

    /// Tasks dropped by permanent reservation failures, to be disposed of
    /// outside the queue lock.
    pub fn take_failed(&mut self) -> Vec<Arc<Task>> {
        std::mem::take(&mut self.failed)
    }

    fn chunk_ready(&mut self, chunk_id: ChunkId, use_flexible_lock: bool) -> ReadyState {
        let Self {
            chunk_map,
            failed,
            task_count,
            ..
        } = self;
        let Some(ct) = chunk_map.get_mut(&chunk_id) else {
            error!(%chunk_id, "chunk missing during readiness check");
            return ReadyState::NotReady;
        };
        let before = failed.len();
        let state = ct.ready(use_flexible_lock, failed);
        *task_count -= failed.len() - before;
        state
    }

    fn chunk_ready_to_advance(&self, chunk_id: ChunkId) -> bool {
        self.chunk_map
            .get(&chunk_id)
            .map(|ct| ct.ready_to_advance())
            .unwrap_or(false)
    }

    /// Whether the in-flight-chunk ceiling forbids starting work on
    /// `chunk_id`. Chunks that already have tasks executing stay eligible.
    fn cap_blocks(&self, chunk_id: ChunkId) -> bool {
        let executing = self
            .chunk_map
            .values()
            .filter(|ct| ct.has_in_flight())
            .count();
        executing >= self.max_active_chunks
            && !self
                .chunk_map
                .get(&chunk_id)
                .map(|ct| ct.has_in_flight())
                .unwrap_or(false)
    }

    fn first_chunk(&self) -> Option<ChunkId> {
        self.chunk_map.keys().next().copied()
    }

    /// The next chunk id after `chunk_id`, wrapping to the start of the
    /// map. Returns `chunk_id` itself when it is the only entry.
    fn next_chunk(&self, chunk_id: ChunkId) -> ChunkId {
        self.chunk_map
            .range((Bound::Excluded(chunk_id), Bound::Unbounded))
            .next()
            .map(|(id, _)| *id)
            .or_else(|| self.first_chunk())
            .unwrap_or(chunk_id)
    }

    #[cfg(test)]
    pub(crate) fn assert_accounting(&self) {
        let tracked: usize = self.chunk_map.values().map(|ct| ct.tracked_tasks()).sum();
        assert_eq!(
            tracked, self.task_count,
            "task count out of sync with chunk containers"
        );
    }
}
