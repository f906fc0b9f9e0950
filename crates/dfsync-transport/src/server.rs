//! RPC server that dispatches calls to a handler.
//!
//! One task per connection reads frames. A header frame spawns a call task;
//! later frames with the same request id feed that call's client stream or
//! cancel it. Every call ends with exactly one `RESPONSE|END_STREAM` frame.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deadline::DeadlineContext;
use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message, CallEnvelope, CallMetadata};
use crate::protocol::{Frame, FrameFlags, Opcode};
use crate::rpc::CallContext;
use crate::status::{RpcReply, RpcStatus};
use crate::tcp::TcpConnection;

/// Client stream chunks buffered per call. A full buffer pauses reading the
/// connection until the call drains it, is cancelled or passes its deadline.
pub const INBOUND_BUFFER: usize = 16;

/// Handles one call and returns its encoded reply body.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Runs the call to completion. Stream bytes go through `call.sink`.
    async fn handle(&self, call: ServerCall) -> RpcReply<Vec<u8>>;
}

/// Encodes a reply body for [`CallHandler::handle`].
pub fn encode_body<T: Serialize>(value: &T) -> RpcReply<Vec<u8>> {
    serialize_message(value).map_err(|e| RpcStatus::internal(e.to_string()))
}

/// An incoming call.
pub struct ServerCall {
    /// Request id on the wire.
    pub request_id: u64,
    /// Operation.
    pub opcode: Opcode,
    /// Out-of-band metadata.
    pub metadata: CallMetadata,
    /// Bincode request body.
    pub body: Vec<u8>,
    /// Client-streamed chunks; empty for unary calls.
    pub inbound: Inbound,
    /// Server-streamed chunks.
    pub sink: ResponseSink,
    /// Deadline and cancellation.
    pub ctx: CallContext,
}

enum StreamItem {
    Chunk(Vec<u8>),
    End,
}

/// Receiving half of a client stream.
pub struct Inbound {
    rx: Option<mpsc::Receiver<StreamItem>>,
    ctx: CallContext,
}

impl Inbound {
    /// Next chunk, or `None` once the client closed its stream.
    ///
    /// Cancellation or an expired deadline yields `DEADLINE_EXCEEDED`; a
    /// stream cut off without its end frame yields `INTERNAL`.
    pub async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, RpcStatus> {
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return Ok(None),
        };
        self.ctx.check()?;
        let item = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => return Err(RpcStatus::deadline_exceeded("cancelled while reading stream")),
            item = rx.recv() => item,
        };
        match item {
            Some(StreamItem::Chunk(data)) => Ok(Some(data)),
            Some(StreamItem::End) => {
                self.rx = None;
                Ok(None)
            }
            None => Err(RpcStatus::internal("client stream closed before end")),
        }
    }
}

/// Sending half of a server stream.
#[derive(Clone)]
pub struct ResponseSink {
    conn: Arc<TcpConnection>,
    opcode: Opcode,
    request_id: u64,
}

impl ResponseSink {
    /// Sends one chunk to the client.
    pub async fn send_data(&self, chunk: &[u8]) -> std::result::Result<(), RpcStatus> {
        let frame = Frame::new(
            self.opcode,
            self.request_id,
            FrameFlags::RESPONSE | FrameFlags::DATA,
            chunk.to_vec(),
        );
        self.conn
            .send_frame(&frame)
            .await
            .map_err(|e| RpcStatus::deadline_exceeded(format!("client went away: {}", e)))
    }

    async fn finish(&self, reply: &RpcReply<Vec<u8>>) -> Result<()> {
        let frame = Frame::new(
            self.opcode,
            self.request_id,
            FrameFlags::RESPONSE | FrameFlags::END_STREAM,
            serialize_message(reply)?,
        );
        self.conn.send_frame(&frame).await
    }
}

struct InFlight {
    ctx: CallContext,
    inbound: Option<mpsc::Sender<StreamItem>>,
}

/// Accept loop.
pub struct RpcServer;

impl RpcServer {
    /// Serves connections until `shutdown` is cancelled.
    pub async fn serve(
        listener: TcpListener,
        handler: Arc<dyn CallHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "RPC server listening");
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "failed to set TCP_NODELAY");
            }
            debug!(peer = %peer, "accepted connection");
            let conn = match TcpConnection::from_stream(stream) {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    warn!(error = %e, "failed to create connection");
                    continue;
                }
            };
            let handler = handler.clone();
            let token = shutdown.child_token();
            tokio::spawn(serve_connection(conn, handler, token));
        }
        info!("RPC server stopped accepting");
        Ok(())
    }
}

async fn serve_connection(
    conn: Arc<TcpConnection>,
    handler: Arc<dyn CallHandler>,
    conn_token: CancellationToken,
) {
    let inflight: Arc<DashMap<u64, InFlight>> = Arc::new(DashMap::new());
    loop {
        let frame = tokio::select! {
            _ = conn_token.cancelled() => break,
            frame = conn.recv_frame() => frame,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(TransportError::ConnectionReset) => {
                debug!(peer = conn.peer_addr(), "connection closed");
                break;
            }
            Err(e) => {
                warn!(peer = conn.peer_addr(), error = %e, "dropping connection");
                break;
            }
        };
        let request_id = frame.request_id();

        if frame.opcode() == Opcode::Cancel {
            if let Some(call) = inflight.get(&request_id) {
                debug!(request_id, "call cancelled by client");
                call.ctx.cancel();
            }
            continue;
        }

        // The map guard must be gone before the send below awaits.
        let route = inflight.get_mut(&request_id).map(|mut call| {
            let tx = if frame.is_end_stream() {
                call.inbound.take()
            } else {
                call.inbound.clone()
            };
            (tx, call.ctx.clone())
        });
        if let Some((tx, ctx)) = route {
            if let Some(tx) = tx {
                forward(&tx, &ctx, frame).await;
            }
            continue;
        }

        if frame.is_data() || (frame.is_end_stream() && frame.payload.is_empty()) {
            // Stream frame for a call that already finished.
            debug!(request_id, "dropping stray stream frame");
            continue;
        }

        start_call(&conn, &handler, &conn_token, &inflight, frame).await;
    }
    // Cancels every call still running on this connection.
    conn_token.cancel();
}

/// Hands one stream frame to its call, waiting while the call's buffer is full.
async fn forward(tx: &mpsc::Sender<StreamItem>, ctx: &CallContext, frame: Frame) {
    let end = frame.is_end_stream();
    let mut items = Vec::with_capacity(2);
    if frame.is_data() && !frame.payload.is_empty() {
        items.push(StreamItem::Chunk(frame.payload));
    }
    if end {
        items.push(StreamItem::End);
    }
    for item in items {
        tokio::select! {
            res = tx.send(item) => {
                if res.is_err() {
                    // The call already returned.
                    return;
                }
            }
            _ = ctx.cancelled() => {
                debug!("dropping stream frame for a cancelled call");
                return;
            }
        }
    }
}

async fn start_call(
    conn: &Arc<TcpConnection>,
    handler: &Arc<dyn CallHandler>,
    conn_token: &CancellationToken,
    inflight: &Arc<DashMap<u64, InFlight>>,
    frame: Frame,
) {
    let request_id = frame.request_id();
    let opcode = frame.opcode();
    let unary = frame.is_end_stream();
    let sink = ResponseSink {
        conn: conn.clone(),
        opcode,
        request_id,
    };

    let envelope: CallEnvelope = match deserialize_message(&frame.payload) {
        Ok(env) => env,
        Err(e) => {
            warn!(request_id, error = %e, "malformed call envelope");
            let reply: RpcReply<Vec<u8>> = Err(RpcStatus::internal(format!("malformed call: {}", e)));
            if let Err(e) = sink.finish(&reply).await {
                debug!(request_id, error = %e, "failed to send reply");
            }
            return;
        }
    };

    let ctx = CallContext::new(
        DeadlineContext::from_timeout_ms(envelope.metadata.timeout_ms),
        conn_token.child_token(),
    );
    let (tx, rx) = if unary {
        (None, None)
    } else {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        (Some(tx), Some(rx))
    };
    inflight.insert(
        request_id,
        InFlight {
            ctx: ctx.clone(),
            inbound: tx,
        },
    );

    let call = ServerCall {
        request_id,
        opcode,
        metadata: envelope.metadata,
        body: envelope.body,
        inbound: Inbound {
            rx,
            ctx: ctx.clone(),
        },
        sink: sink.clone(),
        ctx,
    };
    let handler = handler.clone();
    let inflight = inflight.clone();
    tokio::spawn(async move {
        let reply = handler.handle(call).await;
        if let Err(status) = &reply {
            debug!(request_id, ?opcode, code = %status.code, "call failed");
        }
        if let Err(e) = sink.finish(&reply).await {
            debug!(request_id, error = %e, "failed to send reply");
        }
        inflight.remove(&request_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{decode_reply, CallEvent, RpcClient};
    use crate::message::FileRequest;
    use crate::status::StatusCode;
    use std::time::Duration;

    struct TestHandler;

    #[async_trait]
    impl CallHandler for TestHandler {
        async fn handle(&self, mut call: ServerCall) -> RpcReply<Vec<u8>> {
            match call.opcode {
                Opcode::GetFileStatus => {
                    let req: FileRequest = deserialize_message(&call.body)
                        .map_err(|e| RpcStatus::internal(e.to_string()))?;
                    encode_body(&format!("{}:{:?}", req.name, call.metadata.client_id))
                }
                Opcode::WriteFile => {
                    let mut total = 0u64;
                    while let Some(chunk) = call.inbound.next_chunk().await? {
                        total += chunk.len() as u64;
                    }
                    encode_body(&total)
                }
                Opcode::GetFile => {
                    for part in [&b"abc"[..], &b"def"[..]] {
                        call.sink.send_data(part).await?;
                    }
                    encode_body(&6u64)
                }
                Opcode::CallbackList => {
                    // Slow consumer: the sender runs ahead into the buffer.
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let mut total = 0u64;
                    while let Some(chunk) = call.inbound.next_chunk().await? {
                        total += chunk.len() as u64;
                    }
                    encode_body(&total)
                }
                Opcode::AcquireWriteLock | Opcode::ListFiles => {
                    call.ctx.cancelled().await;
                    Err(RpcStatus::deadline_exceeded("gave up"))
                }
                _ => Err(RpcStatus::not_found("no such operation")),
            }
        }
    }

    async fn start() -> (RpcClient, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = RpcServer::serve(listener, Arc::new(TestHandler), token).await;
        });
        (RpcClient::connect(&addr).await.unwrap(), shutdown)
    }

    #[tokio::test]
    async fn test_unary_roundtrip() {
        let (client, shutdown) = start().await;
        let reply: String = client
            .unary(
                Opcode::GetFileStatus,
                CallMetadata::for_client("alpha"),
                &FileRequest { name: "a.txt".into() },
            )
            .await
            .unwrap();
        assert_eq!(reply, "a.txt:Some(\"alpha\")");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_remote_status() {
        let (client, shutdown) = start().await;
        let err = client
            .unary::<_, u64>(Opcode::DeleteFile, CallMetadata::default(), &())
            .await
            .unwrap_err();
        match err {
            TransportError::Status(status) => assert_eq!(status.code, StatusCode::NotFound),
            other => panic!("expected remote status, got {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_stream() {
        let (client, shutdown) = start().await;
        let mut call = client
            .start_call(Opcode::WriteFile, CallMetadata::default(), &(), false)
            .await
            .unwrap();
        call.send_data(&[1u8; 4096]).await.unwrap();
        call.send_data(&[2u8; 100]).await.unwrap();
        call.finish_send().await.unwrap();
        let total: u64 = match call.recv().await.unwrap() {
            CallEvent::Reply(payload) => decode_reply(&payload).unwrap(),
            CallEvent::Data(_) => panic!("unexpected data"),
        };
        assert_eq!(total, 4196);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_slow_stream_reader_loses_nothing() {
        let (client, shutdown) = start().await;
        let mut call = client
            .start_call(Opcode::CallbackList, CallMetadata::default(), &(), false)
            .await
            .unwrap();
        let chunks = INBOUND_BUFFER * 4;
        for i in 0..chunks {
            call.send_data(&[i as u8; 1024]).await.unwrap();
        }
        call.finish_send().await.unwrap();
        let total: u64 = match call.recv().await.unwrap() {
            CallEvent::Reply(payload) => decode_reply(&payload).unwrap(),
            CallEvent::Data(_) => panic!("unexpected data"),
        };
        assert_eq!(total, (chunks * 1024) as u64);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stalled_stream_frees_connection_at_deadline() {
        let (client, shutdown) = start().await;
        let metadata = CallMetadata::default().with_timeout_ms(200);
        let mut call = client
            .start_call(Opcode::AcquireWriteLock, metadata, &(), false)
            .await
            .unwrap();
        // Nobody reads this stream; the buffer fills and the reader waits.
        for _ in 0..INBOUND_BUFFER * 4 {
            call.send_data(&[7u8; 1024]).await.unwrap();
        }
        call.finish_send().await.unwrap();
        drop(call);

        let reply: String = tokio::time::timeout(
            Duration::from_secs(5),
            client.unary(
                Opcode::GetFileStatus,
                CallMetadata::default(),
                &FileRequest { name: "c.txt".into() },
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply, "c.txt:None");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_server_stream() {
        let (client, shutdown) = start().await;
        let mut call = client
            .start_call(Opcode::GetFile, CallMetadata::default(), &(), true)
            .await
            .unwrap();
        let mut bytes = Vec::new();
        loop {
            match call.recv().await.unwrap() {
                CallEvent::Data(chunk) => bytes.extend_from_slice(&chunk),
                CallEvent::Reply(payload) => {
                    let n: u64 = decode_reply(&payload).unwrap();
                    assert_eq!(n, 6);
                    break;
                }
            }
        }
        assert_eq!(bytes, b"abcdef");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_server_deadline_from_metadata() {
        let (client, shutdown) = start().await;
        let metadata = CallMetadata::default().with_timeout_ms(50);
        let started = std::time::Instant::now();
        let err = client
            .unary::<_, u64>(Opcode::ListFiles, metadata, &())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            TransportError::Status(status) => {
                assert_eq!(status.code, StatusCode::DeadlineExceeded)
            }
            TransportError::RequestTimeout { .. } => {}
            other => panic!("unexpected error {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_frame_releases_server_call() {
        let (client, shutdown) = start().await;
        let mut call = client
            .start_call(Opcode::ListFiles, CallMetadata::default(), &(), true)
            .await
            .unwrap();
        call.cancel().await;
        drop(call);
        // The connection stays usable after a cancelled call.
        let reply: String = client
            .unary(
                Opcode::GetFileStatus,
                CallMetadata::default(),
                &FileRequest { name: "b.txt".into() },
            )
            .await
            .unwrap();
        assert_eq!(reply, "b.txt:None");
        shutdown.cancel();
    }
}
