//! Worker base types shared by the scheduler and the dispatch service: the
//! immutable [`Task`] descriptor and the [`SendChannel`] reply sink.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod send_channel;
mod task;

pub use send_channel::*;
pub use task::*;
