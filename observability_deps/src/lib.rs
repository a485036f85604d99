//! This crate exists to coordinate versions of the observability ecosystem
//! used by the rest of the workspace. Everything logs through
//! `observability_deps::tracing` so the stack can be swapped in one place.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub use tracing;
