//! Memory reservation broker for shared-scan tables.
//!
//! Before a task may run, the backing pages of every table it scans must be
//! locked into RAM so the shared scan cannot be evicted mid-read. A
//! [`MemMan`] implementation either locks the whole set atomically or fails;
//! in *flexible* mode it may succeed with a partial set, recording in the
//! returned [`Reservation`] which tables are actually resident so the
//! executor can pick a plan.
//!
//! Implementations must complete [`MemMan::reserve`] without blocking on the
//! network: the scheduler calls it while holding its queue mutex.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{ChunkId, ScanTable};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use snafu::Snafu;
use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Errors returned by [`MemMan::reserve`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum MemManError {
    /// Transient: the tables do not fit right now. The caller should stop
    /// advancing and retry once running tasks release their locks.
    #[snafu(display("insufficient memory to lock {} table(s) for chunk {}", count, chunk))]
    InsufficientMemory { chunk: ChunkId, count: usize },

    /// Permanent: the manager cannot ever satisfy this request (unknown
    /// table, corrupt mapping). The task must be failed, not retried.
    #[snafu(display("memory manager failure for chunk {}: {}", chunk, message))]
    Permanent { chunk: ChunkId, message: String },
}

impl MemManError {
    /// `true` when retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Reservation identifier, unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(u64);

impl ReservationId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque token for locked pages, returned by [`MemMan::reserve`] and
/// surrendered through [`MemMan::release`].
///
/// A flexible reservation may cover only part of the requested table set;
/// [`Reservation::is_resident`] reports whether a given table made it in. At
/// minimum the first (slowest) table of the request is always resident.
#[derive(Debug)]
pub struct Reservation {
    id: ReservationId,
    chunk: ChunkId,
    resident: Vec<ScanTable>,
    partial: bool,
}

impl Reservation {
    fn new(chunk: ChunkId, resident: Vec<ScanTable>, partial: bool) -> Self {
        Self {
            id: ReservationId::next(),
            chunk,
            resident,
            partial,
        }
    }

    /// The reservation id.
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// The chunk the locked tables belong to.
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// The tables whose pages are locked.
    pub fn resident_tables(&self) -> &[ScanTable] {
        &self.resident
    }

    /// Whether a flexible reservation left part of the request unlocked.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Whether `db.table` is locked by this reservation.
    pub fn is_resident(&self, db: &str, table: &str) -> bool {
        self.resident.iter().any(|t| t.db == db && t.table == table)
    }
}

/// The broker that locks table pages into RAM.
pub trait MemMan: Send + Sync + fmt::Debug {
    /// Atomically lock the pages backing `tables` for `chunk`.
    ///
    /// With `flexible` set, the implementation may return a partial
    /// [`Reservation`], but it must cover at least the first table of
    /// `tables` (the slowest one; the caller orders the slice).
    fn reserve(
        &self,
        tables: &[ScanTable],
        chunk: ChunkId,
        flexible: bool,
    ) -> Result<Reservation, MemManError>;

    /// Unlock the pages held by `reservation`.
    fn release(&self, reservation: Reservation);

    /// Number of reservations currently outstanding.
    fn outstanding(&self) -> usize;
}

/// A [`MemMan`] that locks nothing and grants everything.
///
/// Used when the host has no memory pressure to manage (or the real broker
/// is disabled); every reservation is full and release is bookkeeping only.
#[derive(Debug, Default)]
pub struct MemManNone {
    outstanding: AtomicU64,
}

impl MemManNone {
    /// Create a grant-everything broker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemMan for MemManNone {
    fn reserve(
        &self,
        tables: &[ScanTable],
        chunk: ChunkId,
        _flexible: bool,
    ) -> Result<Reservation, MemManError> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(Reservation::new(chunk, tables.to_vec(), false))
    }

    fn release(&self, reservation: Reservation) {
        debug!(id=%reservation.id(), chunk=%reservation.chunk(), "releasing reservation");
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed) as usize
    }
}

/// Scriptable [`MemMan`] for tests.
///
/// Grants everything by default. Tests can deny all requests, mark
/// individual tables non-resident (visible in flexible mode, fatal
/// otherwise), or inject a permanent failure.
#[derive(Debug, Default)]
pub struct MockMemMan {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    deny_all: bool,
    permanent_error: Option<String>,
    nonresident: HashSet<(String, String)>,
    outstanding: usize,
    reserve_calls: usize,
    released: Vec<ReservationId>,
}

impl MockMemMan {
    /// Create a grant-everything mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny every reservation with a transient error.
    pub fn deny_all(&self, deny: bool) {
        self.state.lock().deny_all = deny;
    }

    /// Fail every reservation permanently.
    pub fn set_permanent_error(&self, message: impl Into<String>) {
        self.state.lock().permanent_error = Some(message.into());
    }

    /// Clear a previously injected permanent failure.
    pub fn clear_permanent_error(&self) {
        self.state.lock().permanent_error = None;
    }

    /// Mark `db.table` as impossible to lock.
    pub fn set_nonresident(&self, db: impl Into<String>, table: impl Into<String>) {
        self.state.lock().nonresident.insert((db.into(), table.into()));
    }

    /// Number of `reserve` calls observed, including failed ones.
    pub fn reserve_calls(&self) -> usize {
        self.state.lock().reserve_calls
    }

    /// Ids released so far, in order.
    pub fn released(&self) -> Vec<ReservationId> {
        self.state.lock().released.clone()
    }
}

impl MemMan for MockMemMan {
    fn reserve(
        &self,
        tables: &[ScanTable],
        chunk: ChunkId,
        flexible: bool,
    ) -> Result<Reservation, MemManError> {
        let mut state = self.state.lock();
        state.reserve_calls += 1;
        if let Some(message) = &state.permanent_error {
            return PermanentSnafu {
                chunk,
                message: message.clone(),
            }
            .fail();
        }
        if state.deny_all {
            return InsufficientMemorySnafu {
                chunk,
                count: tables.len(),
            }
            .fail();
        }
        let resident: Vec<_> = tables
            .iter()
            .filter(|t| !state.nonresident.contains(&(t.db.clone(), t.table.clone())))
            .cloned()
            .collect();
        let partial = resident.len() != tables.len();
        // A lock that leaves tables behind is only legal in flexible mode,
        // and even then the slowest table must be covered.
        let first_resident = match (tables.first(), resident.first()) {
            (Some(want), Some(have)) => want == have,
            (None, None) => true,
            _ => false,
        };
        if (partial && !flexible) || !first_resident {
            return InsufficientMemorySnafu {
                chunk,
                count: tables.len(),
            }
            .fail();
        }
        state.outstanding += 1;
        Ok(Reservation::new(chunk, resident, partial))
    }

    fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.released.push(reservation.id());
    }

    fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}
