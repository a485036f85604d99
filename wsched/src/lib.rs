//! The worker-side shared-scan task scheduler.
//!
//! Tasks arriving from dispatch are grouped by chunk so that queries
//! touching the same slow tables ride the same shared scan. One chunk at a
//! time is the *active* chunk: its tasks are dispatched slowest-tables-first
//! until it drains, while a bounded amount of opportunistic work is allowed
//! on the chunks behind it. A task only becomes runnable once the memory
//! manager has locked its tables into RAM.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk_tasks;
mod chunk_tasks_queue;
mod runner;
mod scheduler;
mod slow_table_heap;

pub use chunk_tasks::*;
pub use chunk_tasks_queue::*;
pub use runner::*;
pub use scheduler::*;
pub use slow_table_heap::*;
