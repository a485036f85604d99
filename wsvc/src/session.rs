//! One transport-bound conversation with the coordinator.

use crate::{
    Error, FramedReplyChannel, InternalSnafu, MsgProcessor, ProvisionSnafu, Result,
};
use bytes::Bytes;
use data_types::ResourceUnit;
use futures::{SinkExt, StreamExt};
use observability_deps::tracing::{debug, info, warn};
use proto::{
    decode_message, encode_message, FrameCodec, QueryRequest, ReplicateRequest, RequestHeader,
    RequestType, StatusRequest, StatusResponse, StopRequest, MAX_FRAME_BYTES,
};
use snafu::ResultExt;
use std::{
    io,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use wbase::Task;

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-frame size limit on the transport.
    pub max_frame_bytes: usize,
    /// How long a dispatched query may run before the session cancels it.
    /// `None` disables the timeout.
    pub dispatch_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
            dispatch_timeout: None,
        }
    }
}

/// A session drives one connection through the read-dispatch-reply cycle.
///
/// The first frame of a connection provisions the session against a
/// resource path; after that each logical request is a header frame plus a
/// body frame. A QUERY binds the session to one task until the task's reply
/// sink makes its terminal call; control requests are answered inline.
///
/// Recoverable errors (bad request, route mismatch) are answered with an
/// error frame and the session keeps serving. Framing and internal errors
/// close the session and cancel the bound task, if any.
#[derive(Debug)]
pub struct Session {
    resource: ResourceUnit,
    processor: Arc<dyn MsgProcessor>,
    config: SessionConfig,
    out: mpsc::UnboundedSender<Bytes>,
    /// The task of the request currently being served. Weak: the queue and
    /// executors own the task; holding it strongly here would keep its
    /// reply channel alive after everyone else dropped it.
    bound: Option<Weak<Task>>,
}

impl Session {
    /// Drive `stream` until the peer disconnects or a fatal error occurs.
    pub async fn serve<T>(
        stream: T,
        processor: Arc<dyn MsgProcessor>,
        config: SessionConfig,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = FrameCodec::new(config.max_frame_bytes);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, codec);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(FramedWrite::new(write_half, codec), out_rx));

        let result = Self::provision(&mut reader, processor, config, out_tx).await;
        let result = match result {
            Ok(mut session) => {
                let result = session.request_loop(&mut reader).await;
                if let Some(task) = session.bound.take().and_then(|weak| weak.upgrade()) {
                    warn!(%task, "session closing; cancelling bound task");
                    task.cancel();
                }
                drop(session);
                result
            }
            Err(e) => Err(e),
        };

        // Let the writer flush whatever was queued before the close.
        drop(reader);
        let _ = writer.await;
        result
    }

    /// Read the provision frame and bind the session to its resource.
    async fn provision<R>(
        reader: &mut FramedRead<R, FrameCodec>,
        processor: Arc<dyn MsgProcessor>,
        config: SessionConfig,
        out: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let frame = require_frame(reader).await?;
        let path = String::from_utf8_lossy(&frame);
        let resource = match path.parse::<ResourceUnit>().context(ProvisionSnafu) {
            Ok(resource) => resource,
            Err(e) => {
                let _ = out.send(encode_message(&StatusResponse::failed(
                    e.to_string(),
                    e.code(),
                )));
                return Err(e);
            }
        };
        info!(%resource, "session provisioned");
        Ok(Self {
            resource,
            processor,
            config,
            out,
            bound: None,
        })
    }

    async fn request_loop<R>(&mut self, reader: &mut FramedRead<R, FrameCodec>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            // READ_HEADER; a clean close between requests ends the session.
            let frame = match reader.next().await {
                None => {
                    debug!(resource = %self.resource, "peer closed the session");
                    return Ok(());
                }
                Some(frame) => frame?,
            };
            let header: RequestHeader = decode_message(&frame)?;
            match header.request_type() {
                Some(RequestType::Query) => self.handle_query(reader, &header).await?,
                Some(RequestType::Stop) => {
                    let body: StopRequest = decode_message(&require_frame(reader).await?)?;
                    let reply = if self.processor.stop_query(&body.id) {
                        StatusResponse::success("query cancelled")
                    } else {
                        StatusResponse::failed(format!("unknown query id {}", body.id), 404)
                    };
                    self.reply(reply);
                }
                Some(RequestType::Status) => {
                    let body: StatusRequest = decode_message(&require_frame(reader).await?)?;
                    let reply = match self.processor.query_status(&body.id) {
                        Some(state) => StatusResponse::success(state),
                        None => {
                            StatusResponse::failed(format!("unknown query id {}", body.id), 404)
                        }
                    };
                    self.reply(reply);
                }
                Some(RequestType::Replicate) => {
                    let body: ReplicateRequest = decode_message(&require_frame(reader).await?)?;
                    debug!(database = %body.database, chunk = body.chunk, "replicate request refused");
                    self.reply(StatusResponse::failed(
                        "replication requests are not serviced by this worker",
                        501,
                    ));
                }
                None => {
                    let e = Error::UnknownRequestType {
                        value: header.r#type,
                    };
                    warn!(resource = %self.resource, %e, "rejecting request");
                    self.reply(StatusResponse::failed(e.to_string(), e.code()));
                }
            }
        }
    }

    /// DISPATCH for a QUERY: validate the route, build the task, hand it to
    /// the processor, and wait for the reply sink's terminal call.
    async fn handle_query<R>(
        &mut self,
        reader: &mut FramedRead<R, FrameCodec>,
        header: &RequestHeader,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let body: QueryRequest = decode_message(&require_frame(reader).await?)?;
        let chunk = body.chunk_id();

        if !self.resource.matches_chunk(&body.db, chunk) {
            let e = Error::RouteMismatch {
                db: body.db,
                chunk,
                resource: self.resource.clone(),
            };
            warn!(%e, "rejecting misrouted query");
            self.reply(StatusResponse::failed(e.to_string(), e.code()));
            return Ok(());
        }

        let (channel, mut terminal) = FramedReplyChannel::new(self.out.clone());
        let scan_info = body.scan_info();
        let priority = body.decoded_priority();
        let task = match Task::new(
            &header.id,
            &body.db,
            chunk,
            body.fragments,
            scan_info,
            priority,
            Arc::new(channel),
        ) {
            Ok(task) => task,
            Err(source) => {
                let e = Error::BadRequest { source };
                warn!(%e, "rejecting malformed query");
                self.reply(StatusResponse::failed(e.to_string(), e.code()));
                return Ok(());
            }
        };

        debug!(%task, "dispatching query");
        self.bound = Some(Arc::downgrade(&task));
        self.processor.process_query(task);

        // The session serves one request at a time: wait for the terminal
        // reply before reading the next header.
        let terminated = match self.config.dispatch_timeout {
            None => terminal.changed().await,
            Some(limit) => match tokio::time::timeout(limit, terminal.changed()).await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(task) = self.bound.as_ref().and_then(Weak::upgrade) {
                        warn!(%task, ?limit, "dispatch timeout; cancelling query");
                        task.cancel();
                    }
                    // The executor still owes the terminal reply.
                    terminal.changed().await
                }
            },
        };
        if terminated.is_err() {
            return InternalSnafu {
                message: "reply channel dropped without a terminal call",
            }
            .fail();
        }
        self.bound = None;
        Ok(())
    }

    fn reply(&self, status: StatusResponse) {
        if self.out.send(encode_message(&status)).is_err() {
            warn!(resource = %self.resource, "reply dropped; writer is gone");
        }
    }
}

/// Read the next frame, treating EOF as a framing error: the peer hung up
/// in the middle of a logical request.
async fn require_frame<R>(reader: &mut FramedRead<R, FrameCodec>) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(frame) => Ok(frame?),
        None => Err(proto::FrameError::from(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-request",
        ))
        .into()),
    }
}

async fn write_frames<W>(
    mut framed: FramedWrite<W, FrameCodec>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = frames.recv().await {
        if let Err(e) = framed.send(payload).await {
            warn!(%e, "reply write failed; discarding remaining frames");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MsgProcessor;
    use assert_matches::assert_matches;
    use proto::{Priority, RequestType, ResponseStatus, ResultFrame, ScanTable};
    use std::fmt;
    use tokio::io::DuplexStream;
    use wbase::SendChannel;

    /// Processor double that answers queries inline through the reply sink.
    #[derive(Debug, Default)]
    struct InlineProcessor;

    impl MsgProcessor for InlineProcessor {
        fn process_query(&self, task: Arc<Task>) {
            let reply = task.fragments().join(";");
            task.send_channel().send_stream(reply.as_bytes(), true);
        }

        fn stop_query(&self, id: &str) -> bool {
            id == "known"
        }

        fn query_status(&self, id: &str) -> Option<String> {
            (id == "known").then(|| "queued".to_string())
        }
    }

    /// Processor double that drops the task without any reply.
    #[derive(Default)]
    struct SilentProcessor;

    impl fmt::Debug for SilentProcessor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("SilentProcessor")
        }
    }

    impl MsgProcessor for SilentProcessor {
        fn process_query(&self, _task: Arc<Task>) {}

        fn stop_query(&self, _id: &str) -> bool {
            false
        }

        fn query_status(&self, _id: &str) -> Option<String> {
            None
        }
    }

    struct Client {
        reader: FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>,
        writer: FramedWrite<tokio::io::WriteHalf<DuplexStream>, FrameCodec>,
    }

    impl Client {
        fn new(stream: DuplexStream) -> Self {
            let (read_half, write_half) = tokio::io::split(stream);
            Self {
                reader: FramedRead::new(read_half, FrameCodec::default()),
                writer: FramedWrite::new(write_half, FrameCodec::default()),
            }
        }

        async fn send_raw(&mut self, payload: Bytes) {
            self.writer.send(payload).await.unwrap();
        }

        async fn send_msg<M: prost::Message>(&mut self, msg: &M) {
            self.send_raw(encode_message(msg)).await;
        }

        async fn provision(&mut self, path: &str) {
            self.send_raw(Bytes::copy_from_slice(path.as_bytes())).await;
        }

        async fn recv(&mut self) -> Bytes {
            self.reader.next().await.expect("frame expected").unwrap()
        }

        async fn query(&mut self, id: &str, db: &str, chunk: u32, fragments: &[&str]) {
            self.send_msg(&RequestHeader {
                r#type: RequestType::Query as i32,
                id: id.to_string(),
            })
            .await;
            self.send_msg(&QueryRequest {
                db: db.to_string(),
                chunk,
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                scan_tables: vec![ScanTable {
                    db: db.to_string(),
                    table: "Object".to_string(),
                    slowness: 10,
                }],
                priority: Priority::Medium as i32,
            })
            .await;
        }
    }

    fn spawn_session(
        processor: Arc<dyn MsgProcessor>,
        config: SessionConfig,
    ) -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (server_side, client_side) = tokio::io::duplex(1024 * 1024);
        let handle = tokio::spawn(Session::serve(server_side, processor, config));
        (Client::new(client_side), handle)
    }

    #[tokio::test]
    async fn query_round_trip() {
        let (mut client, session) =
            spawn_session(Arc::new(InlineProcessor), SessionConfig::default());
        client.provision("/chunk/LSST/3240").await;
        client.query("q1", "LSST", 3240, &["SELECT 1", "SELECT 2"]).await;

        let frame: ResultFrame = decode_message(&client.recv().await).unwrap();
        assert_eq!(frame.rows, b"SELECT 1;SELECT 2");
        assert!(frame.last);

        // The session is free for the next request on the same connection.
        client.query("q2", "LSST", 3240, &["SELECT 3"]).await;
        let frame: ResultFrame = decode_message(&client.recv().await).unwrap();
        assert_eq!(frame.rows, b"SELECT 3");

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn misrouted_query_keeps_the_session() {
        let (mut client, session) =
            spawn_session(Arc::new(InlineProcessor), SessionConfig::default());
        client.provision("/chunk/LSST/3240").await;

        client.query("q1", "LSST", 9999, &["SELECT 1"]).await;
        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.status, ResponseStatus::Failed as i32);
        assert_eq!(status.code, 404);

        client.query("q2", "SDSS", 3240, &["SELECT 1"]).await;
        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.code, 404);

        // Still serving.
        client.query("q3", "LSST", 3240, &["SELECT 1"]).await;
        let frame: ResultFrame = decode_message(&client.recv().await).unwrap();
        assert!(frame.last);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_query_gets_bad_request() {
        let (mut client, session) =
            spawn_session(Arc::new(InlineProcessor), SessionConfig::default());
        client.provision("/chunk/LSST/3240").await;

        client.query("q1", "LSST", 3240, &[]).await;
        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.code, 400);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn control_requests_are_answered_inline() {
        let (mut client, session) =
            spawn_session(Arc::new(InlineProcessor), SessionConfig::default());
        client.provision("/chunk/LSST/3240").await;

        client
            .send_msg(&RequestHeader {
                r#type: RequestType::Stop as i32,
                id: "ctl".to_string(),
            })
            .await;
        client
            .send_msg(&StopRequest {
                id: "known".to_string(),
            })
            .await;
        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.status, ResponseStatus::Success as i32);

        client
            .send_msg(&RequestHeader {
                r#type: RequestType::Status as i32,
                id: "ctl".to_string(),
            })
            .await;
        client
            .send_msg(&StatusRequest {
                id: "missing".to_string(),
            })
            .await;
        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.code, 404);

        client
            .send_msg(&RequestHeader {
                r#type: RequestType::Replicate as i32,
                id: "ctl".to_string(),
            })
            .await;
        client
            .send_msg(&ReplicateRequest {
                database: "LSST".to_string(),
                chunk: 3240,
                id: "r1".to_string(),
            })
            .await;
        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.code, 501);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn zero_length_frame_closes_the_session() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(Session::serve(
            server_side,
            Arc::new(InlineProcessor) as Arc<dyn MsgProcessor>,
            SessionConfig::default(),
        ));
        let mut client = Client::new(client_side);
        client.provision("/chunk/LSST/3240").await;

        // Raw zero-length frame: bypass the codec, which refuses to encode it.
        use tokio::io::AsyncWriteExt;
        let mut inner = client.writer.into_inner();
        inner.write_all(&[0u8, 0, 0, 0]).await.unwrap();
        inner.flush().await.unwrap();

        let result = session.await.unwrap();
        assert_matches!(result, Err(Error::Framing { .. }));
    }

    #[tokio::test]
    async fn eof_mid_request_is_a_framing_error() {
        let (mut client, session) =
            spawn_session(Arc::new(InlineProcessor), SessionConfig::default());
        client.provision("/chunk/LSST/3240").await;

        // Header with no body, then hang up.
        client
            .send_msg(&RequestHeader {
                r#type: RequestType::Query as i32,
                id: "q1".to_string(),
            })
            .await;
        drop(client);

        let result = session.await.unwrap();
        assert_matches!(result, Err(Error::Framing { .. }));
    }

    #[tokio::test]
    async fn invalid_provision_path_is_rejected() {
        let (mut client, session) =
            spawn_session(Arc::new(InlineProcessor), SessionConfig::default());
        client.provision("/garbage/nope").await;

        let status: StatusResponse = decode_message(&client.recv().await).unwrap();
        assert_eq!(status.code, 400);
        let result = session.await.unwrap();
        assert_matches!(result, Err(Error::Provision { .. }));
    }

    #[tokio::test]
    async fn dropped_reply_channel_is_an_internal_error() {
        let (mut client, session) = spawn_session(
            Arc::new(SilentProcessor::default()),
            SessionConfig::default(),
        );
        client.provision("/chunk/LSST/3240").await;
        client.query("q1", "LSST", 3240, &["SELECT 1"]).await;

        // The processor dropped the task without a terminal reply; the
        // session cannot tell the coordinator anything coherent, so the
        // violation is fatal.
        let result = session.await.unwrap();
        assert_matches!(result, Err(Error::Internal { .. }));
    }
}

