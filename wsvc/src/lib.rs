//! The dispatch service: accepts framed requests from the coordinator,
//! binds each QUERY to a scheduler task, and streams replies back.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod error;
mod processor;
mod reply;
mod server;
mod session;

pub use error::*;
pub use processor::*;
pub use reply::*;
pub use server::*;
pub use session::*;
