//! The byte-oriented channel an executor streams a task's results through.

use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use std::{fmt, fs::File, io::Read, sync::Arc};

/// How much of a spooled result file is read per stream frame.
const FILE_CHUNK_BYTES: usize = 64 * 1024;

/// The reply sink bound to one inbound request.
///
/// Exactly one terminal call is made per request: `send_error`, a
/// `send_stream` with `last` set, or a successful `send`/`send_file`. All
/// methods return `false` on transport error; the caller stops streaming
/// once that happens.
///
/// Implementations must tolerate being called from executor threads, so the
/// contract is synchronous and byte oriented.
pub trait SendChannel: Send + Sync + fmt::Debug {
    /// Single-shot reply: `buf` is the entire response.
    fn send(&self, buf: &[u8]) -> bool;

    /// Error reply. Terminal for the current request.
    fn send_error(&self, message: &str, code: i32) -> bool;

    /// Stream the contents of a local file as a chunked reply.
    ///
    /// On a read failure this degrades to [`SendChannel::send_error`]; the
    /// frame boundary keeps the transport consistent.
    fn send_file(&self, file: File, size: u64) -> bool;

    /// Chunked reply; `last` completes the response and releases the
    /// session for the next request.
    fn send_stream(&self, buf: &[u8], last: bool) -> bool;
}

/// Default [`SendChannel::send_file`] in terms of [`SendChannel::send_stream`],
/// shared by implementations that have no zero-copy path.
pub fn stream_file(channel: &dyn SendChannel, mut file: File, size: u64) -> bool {
    let mut remaining = size;
    let mut buf = vec![0u8; FILE_CHUNK_BYTES];
    while remaining > 0 {
        let want = remaining.min(FILE_CHUNK_BYTES as u64) as usize;
        match file.read(&mut buf[..want]) {
            Ok(0) => {
                warn!(remaining, size, "result file truncated");
                return channel.send_error("result file truncated", 500);
            }
            Ok(n) => {
                remaining -= n as u64;
                if !channel.send_stream(&buf[..n], remaining == 0) {
                    return false;
                }
            }
            Err(e) => {
                warn!(%e, "error reading result file");
                return channel.send_error("error reading result file", 500);
            }
        }
    }
    // Zero-byte file: still terminate the response.
    if size == 0 {
        return channel.send_stream(&[], true);
    }
    true
}

/// A channel that logs and discards everything. Placeholder wiring for
/// sessions that are torn down before a real channel exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopChannel;

impl SendChannel for NopChannel {
    fn send(&self, buf: &[u8]) -> bool {
        debug!(len = buf.len(), "NopChannel send");
        true
    }

    fn send_error(&self, message: &str, code: i32) -> bool {
        debug!(message, code, "NopChannel send_error");
        true
    }

    fn send_file(&self, file: File, size: u64) -> bool {
        stream_file(self, file, size)
    }

    fn send_stream(&self, buf: &[u8], last: bool) -> bool {
        debug!(len = buf.len(), last, "NopChannel send_stream");
        true
    }
}

/// A channel that appends everything to a shared in-memory buffer, for tests
/// and tools that want to inspect a task's reply bytes.
#[derive(Debug, Default)]
pub struct BufferChannel {
    dest: Mutex<Vec<u8>>,
    errors: Mutex<Vec<(i32, String)>>,
}

impl BufferChannel {
    /// Create an empty capture channel.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes captured so far.
    pub fn contents(&self) -> Vec<u8> {
        self.dest.lock().clone()
    }

    /// Error replies captured so far.
    pub fn errors(&self) -> Vec<(i32, String)> {
        self.errors.lock().clone()
    }
}

impl SendChannel for BufferChannel {
    fn send(&self, buf: &[u8]) -> bool {
        self.dest.lock().extend_from_slice(buf);
        true
    }

    fn send_error(&self, message: &str, code: i32) -> bool {
        self.errors.lock().push((code, message.to_string()));
        true
    }

    fn send_file(&self, file: File, size: u64) -> bool {
        stream_file(self, file, size)
    }

    fn send_stream(&self, buf: &[u8], last: bool) -> bool {
        debug!(len = buf.len(), last, "BufferChannel send_stream");
        self.dest.lock().extend_from_slice(buf);
        true
    }
}
