//! The production reply sink: frames results onto the session's transport.

use bytes::Bytes;
use observability_deps::tracing::warn;
use proto::{encode_message, ResultFrame, StatusResponse};
use std::{
    fs::File,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::{mpsc, watch};
use wbase::{stream_file, SendChannel};

/// A [`SendChannel`] that hands length-prefixed reply frames to the session's
/// writer task.
///
/// The channel enforces the one-terminal-call contract: anything sent after
/// the terminal reply is logged and dropped. The watch handle returned by
/// [`FramedReplyChannel::new`] flips once the terminal call is made, which
/// is what releases the session for its next request.
#[derive(Debug)]
pub struct FramedReplyChannel {
    out: mpsc::UnboundedSender<Bytes>,
    terminal: watch::Sender<bool>,
    terminal_sent: AtomicBool,
}

impl FramedReplyChannel {
    /// Create a channel writing to `out`, plus the terminal-call watch.
    pub fn new(out: mpsc::UnboundedSender<Bytes>) -> (Self, watch::Receiver<bool>) {
        let (terminal, watch_rx) = watch::channel(false);
        (
            Self {
                out,
                terminal,
                terminal_sent: AtomicBool::new(false),
            },
            watch_rx,
        )
    }

    /// Whether the terminal reply was already made.
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::Relaxed)
    }

    fn push(&self, payload: Bytes) -> bool {
        self.out.send(payload).is_ok()
    }

    fn guard_terminal(&self, what: &str) -> bool {
        if self.terminal_sent() {
            warn!(what, "reply after terminal call dropped");
            return false;
        }
        true
    }

    fn mark_terminal(&self) {
        self.terminal_sent.store(true, Ordering::Relaxed);
        // The session may already be gone; nothing to do then.
        let _ = self.terminal.send(true);
    }
}

impl SendChannel for FramedReplyChannel {
    fn send(&self, buf: &[u8]) -> bool {
        if !self.guard_terminal("send") {
            return false;
        }
        let ok = self.push(Bytes::copy_from_slice(buf));
        self.mark_terminal();
        ok
    }

    fn send_error(&self, message: &str, code: i32) -> bool {
        if !self.guard_terminal("send_error") {
            return false;
        }
        let ok = self.push(encode_message(&StatusResponse::failed(message, code)));
        self.mark_terminal();
        ok
    }

    fn send_file(&self, file: File, size: u64) -> bool {
        stream_file(self, file, size)
    }

    fn send_stream(&self, buf: &[u8], last: bool) -> bool {
        if !self.guard_terminal("send_stream") {
            return false;
        }
        let ok = self.push(encode_message(&ResultFrame {
            rows: buf.to_vec(),
            last,
        }));
        if last {
            self.mark_terminal();
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::decode_message;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut out = vec![];
        while let Ok(b) = rx.try_recv() {
            out.push(b);
        }
        out
    }

    #[test]
    fn streaming_terminates_on_last() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (channel, watch_rx) = FramedReplyChannel::new(tx);

        assert!(!*watch_rx.borrow());
        assert!(channel.send_stream(b"a", false));
        assert!(!channel.terminal_sent());
        assert!(channel.send_stream(b"b", true));
        assert!(channel.terminal_sent());
        assert!(*watch_rx.borrow());

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        let first: ResultFrame = decode_message(&frames[0]).unwrap();
        assert_eq!(first.rows, b"a");
        assert!(!first.last);
        let second: ResultFrame = decode_message(&frames[1]).unwrap();
        assert!(second.last);
    }

    #[test]
    fn replies_after_terminal_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (channel, _watch_rx) = FramedReplyChannel::new(tx);

        assert!(channel.send_error("boom", 500));
        assert!(!channel.send_stream(b"late", true));
        assert!(!channel.send(b"later"));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let status: StatusResponse = decode_message(&frames[0]).unwrap();
        assert_eq!(status.code, 500);
        assert_eq!(status.message, "boom");
    }

    #[test]
    fn single_shot_send_is_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (channel, watch_rx) = FramedReplyChannel::new(tx);
        assert!(channel.send(b"whole reply"));
        assert!(*watch_rx.borrow());
        assert_eq!(drain(&mut rx), vec![Bytes::from_static(b"whole reply")]);
    }

    #[test]
    fn push_fails_once_the_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (channel, _watch_rx) = FramedReplyChannel::new(tx);
        assert!(!channel.send_stream(b"a", true));
        // Terminal state is still recorded so the session can move on.
        assert!(channel.terminal_sent());
    }
}
