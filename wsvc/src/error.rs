//! Error taxonomy of the dispatch service.

use data_types::{ChunkId, ResourceUnit};
use proto::FrameError;
use snafu::Snafu;

/// Dispatch failures.
///
/// `BadRequest`, `Provision`, and `RouteMismatch` are recoverable per
/// request: the session replies with an error frame and keeps serving.
/// `Framing` and `Internal` terminate the owning session; a task bound to
/// the session at that point is cancelled.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("bad request: {}", source))]
    BadRequest { source: wbase::TaskError },

    #[snafu(display("request type {} is not understood", value))]
    UnknownRequestType { value: i32 },

    #[snafu(display(
        "request for db {} chunk {} does not match session resource {}",
        db,
        chunk,
        resource
    ))]
    RouteMismatch {
        db: String,
        chunk: ChunkId,
        resource: ResourceUnit,
    },

    #[snafu(display("invalid provision path: {}", source))]
    Provision { source: data_types::ResourceError },

    #[snafu(context(false), display("framing error: {}", source))]
    Framing { source: FrameError },

    #[snafu(display("internal error: {}", message))]
    Internal { message: String },
}

impl Error {
    /// The wire code reported for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::BadRequest { .. }
            | Self::UnknownRequestType { .. }
            | Self::Provision { .. } => 400,
            Self::RouteMismatch { .. } => 404,
            Self::Framing { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Framing { .. } | Self::Internal { .. })
    }
}

/// Convenience alias for dispatch results.
pub type Result<T, E = Error> = std::result::Result<T, E>;
