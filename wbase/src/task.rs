//! The unit of work dispatched to this worker: one chunk, one or more SQL
//! fragments, and a manifest of the tables the shared scan touches.

use crate::SendChannel;
use data_types::{ChunkId, Priority, ScanInfo};
use memman::Reservation;
use parking_lot::Mutex;
use snafu::{ensure, Snafu};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Task construction failures. These map to a `BadRequest` reply; a
/// malformed task never enters a queue.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum TaskError {
    #[snafu(display("query {} has no fragments", query_id))]
    NoFragments { query_id: String },

    #[snafu(display("query {} has an empty fragment at position {}", query_id, position))]
    EmptyFragment { query_id: String, position: usize },

    #[snafu(display("query {} has no database", query_id))]
    NoDatabase { query_id: String },
}

/// Process-unique task identity, used for set membership while the `Task`
/// itself stays behind an `Arc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable descriptor of a unit of work.
///
/// A task is created by the dispatch layer, owned by whichever per-chunk
/// container currently queues it, and handed to an executor thread once its
/// memory reservation is secured. Nothing about the work itself mutates in
/// flight; the only interior state is the cooperative cancellation flag and
/// the reservation slot.
pub struct Task {
    tid: TaskId,
    query_id: String,
    db: String,
    chunk_id: ChunkId,
    fragments: Vec<String>,
    scan_info: ScanInfo,
    priority: Priority,
    send_channel: Arc<dyn SendChannel>,
    cancelled: AtomicBool,
    reservation: Mutex<Option<Reservation>>,
}

impl Task {
    /// Validate and build a task.
    pub fn new(
        query_id: impl Into<String>,
        db: impl Into<String>,
        chunk_id: ChunkId,
        fragments: Vec<String>,
        scan_info: ScanInfo,
        priority: Priority,
        send_channel: Arc<dyn SendChannel>,
    ) -> Result<Arc<Self>, TaskError> {
        let query_id = query_id.into();
        let db = db.into();
        ensure!(
            !db.is_empty(),
            NoDatabaseSnafu {
                query_id: query_id.as_str()
            }
        );
        ensure!(
            !fragments.is_empty(),
            NoFragmentsSnafu {
                query_id: query_id.as_str()
            }
        );
        if let Some(position) = fragments.iter().position(|f| f.trim().is_empty()) {
            return EmptyFragmentSnafu { query_id, position }.fail();
        }
        Ok(Arc::new(Self {
            tid: TaskId::next(),
            query_id,
            db,
            chunk_id,
            fragments,
            scan_info,
            priority,
            send_channel,
            cancelled: AtomicBool::new(false),
            reservation: Mutex::new(None),
        }))
    }

    /// Process-unique identity.
    pub fn tid(&self) -> TaskId {
        self.tid
    }

    /// The wire-level request id this task was built from.
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Target database.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// The chunk this task targets.
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// SQL fragments, executed in order.
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Table-level slowness manifest.
    pub fn scan_info(&self) -> &ScanInfo {
        &self.scan_info
    }

    /// Advisory priority tier.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The reply sink for this task's results.
    pub fn send_channel(&self) -> &Arc<dyn SendChannel> {
        &self.send_channel
    }

    /// Request cooperative cancellation. Executors check between fragments
    /// and between result-streaming chunks.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Attach the memory reservation that makes this task runnable.
    pub fn attach_reservation(&self, reservation: Reservation) {
        let mut slot = self.reservation.lock();
        debug_assert!(slot.is_none(), "task already holds a reservation");
        *slot = Some(reservation);
    }

    /// Detach the reservation, if any, so the caller can release it.
    pub fn take_reservation(&self) -> Option<Reservation> {
        self.reservation.lock().take()
    }

    /// Whether a reservation is currently attached.
    pub fn has_reservation(&self) -> bool {
        self.reservation.lock().is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.tid)
            .field("query_id", &self.query_id)
            .field("db", &self.db)
            .field("chunk_id", &self.chunk_id)
            .field("fragments", &self.fragments.len())
            .field("scan_info", &self.scan_info)
            .field("priority", &self.priority)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task[{}] qid={} chunk={} db={}",
            self.tid, self.query_id, self.chunk_id, self.db
        )
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.tid == other.tid
    }
}

impl Eq for Task {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NopChannel;
    use assert_matches::assert_matches;
    use data_types::ScanTable;

    fn scan_info() -> ScanInfo {
        ScanInfo::new(vec![ScanTable::new("LSST", "Object", 10)])
    }

    fn channel() -> Arc<dyn SendChannel> {
        Arc::new(NopChannel)
    }

    #[test]
    fn valid_task() {
        let t = Task::new(
            "abc",
            "LSST",
            ChunkId::new(3240),
            vec!["SELECT 1".to_string()],
            scan_info(),
            Priority::Medium,
            channel(),
        )
        .unwrap();
        assert_eq!(t.chunk_id(), ChunkId::new(3240));
        assert_eq!(t.fragments().len(), 1);
        assert_eq!(t.priority(), Priority::Medium);
        assert!(!t.is_cancelled());
        assert!(!t.has_reservation());
    }

    #[test]
    fn tasks_get_unique_ids() {
        let mk = || {
            Task::new(
                "abc",
                "LSST",
                ChunkId::new(1),
                vec!["SELECT 1".to_string()],
                scan_info(),
                Priority::Low,
                channel(),
            )
            .unwrap()
        };
        let a = mk();
        let b = mk();
        let a2 = Arc::clone(&a);
        assert_ne!(a.tid(), b.tid());
        assert!(*a == *a2);
        assert!(*a != *b);
    }

    #[test]
    fn empty_fragments_rejected() {
        let err = Task::new(
            "abc",
            "LSST",
            ChunkId::new(1),
            vec![],
            scan_info(),
            Priority::Low,
            channel(),
        )
        .unwrap_err();
        assert_matches!(err, TaskError::NoFragments { .. });

        let err = Task::new(
            "abc",
            "LSST",
            ChunkId::new(1),
            vec!["SELECT 1".to_string(), "  ".to_string()],
            scan_info(),
            Priority::Low,
            channel(),
        )
        .unwrap_err();
        assert_matches!(err, TaskError::EmptyFragment { position: 1, .. });
    }

    #[test]
    fn blank_database_rejected() {
        let err = Task::new(
            "abc",
            "",
            ChunkId::new(1),
            vec!["SELECT 1".to_string()],
            scan_info(),
            Priority::Low,
            channel(),
        )
        .unwrap_err();
        assert_matches!(err, TaskError::NoDatabase { .. });
    }

    #[test]
    fn cancel_is_sticky() {
        let t = Task::new(
            "abc",
            "LSST",
            ChunkId::new(1),
            vec!["SELECT 1".to_string()],
            scan_info(),
            Priority::Low,
            channel(),
        )
        .unwrap();
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }
}
