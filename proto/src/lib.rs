//! The wire protocol spoken between the coordinator and this worker.
//!
//! Every message on the byte transport is a *frame*: a 32-bit big-endian
//! length followed by a protobuf payload. A logical request is two
//! back-to-back frames, a [`RequestHeader`] carrying the request type and id
//! followed by a type-specific body. Query results stream back as
//! [`ResultFrame`]s terminated by `last`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod frame;
mod messages;

pub use frame::*;
pub use messages::*;
