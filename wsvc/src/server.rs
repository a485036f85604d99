//! TCP front end: one [`Session`](crate::Session) per accepted connection.

use crate::{MsgProcessor, Session, SessionConfig};
use observability_deps::tracing::{info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts coordinator connections and spawns a session for each.
#[derive(Debug)]
pub struct WorkerServer {
    processor: Arc<dyn MsgProcessor>,
    config: SessionConfig,
}

impl WorkerServer {
    /// Create a server dispatching to `processor`.
    pub fn new(processor: Arc<dyn MsgProcessor>, config: SessionConfig) -> Self {
        Self { processor, config }
    }

    /// Accept connections forever. Callers typically `tokio::spawn` this.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "connection accepted");
                    let processor = Arc::clone(&self.processor);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        match Session::serve(stream, processor, config).await {
                            Ok(()) => info!(%peer, "session closed"),
                            Err(e) => warn!(%peer, %e, "session terminated"),
                        }
                    });
                }
                Err(e) => {
                    warn!(%e, "accept failed");
                }
            }
        }
    }
}
