//! Multiplexing RPC client.
//!
//! One background reader task routes response frames to the call that owns
//! their request id. Each call sees its frames in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message, CallEnvelope, CallMetadata};
use crate::protocol::{Frame, FrameFlags, Opcode};
use crate::status::RpcReply;
use crate::tcp::TcpConnection;

type PendingMap = DashMap<u64, mpsc::UnboundedSender<Frame>>;

/// RPC client over one TCP connection.
pub struct RpcClient {
    conn: Arc<TcpConnection>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    reader: tokio::task::JoinHandle<()>,
}

impl RpcClient {
    /// Connects to `addr` and starts the reader task.
    pub async fn connect(addr: &str) -> Result<Self> {
        let conn = TcpConnection::dial(addr).await?;
        Ok(Self::new(Arc::new(conn)))
    }

    /// Wraps an established connection and starts the reader task.
    pub fn new(conn: Arc<TcpConnection>) -> Self {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let reader_conn = conn.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader_conn.recv_frame().await {
                    Ok(frame) => {
                        let request_id = frame.request_id();
                        let end = frame.is_end_stream();
                        let delivered = match reader_pending.get(&request_id) {
                            Some(tx) => tx.send(frame).is_ok(),
                            None => {
                                debug!(request_id, "response for unknown call, dropping");
                                false
                            }
                        };
                        if end || !delivered {
                            reader_pending.remove(&request_id);
                        }
                    }
                    Err(TransportError::ConnectionReset) => {
                        debug!(peer = reader_conn.peer_addr(), "server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "RPC reader error, stopping");
                        break;
                    }
                }
            }
            // Dropping the senders wakes every waiting call with a reset.
            reader_pending.clear();
        });
        Self {
            conn,
            next_id: AtomicU64::new(1),
            pending,
            reader,
        }
    }

    /// Opens a call. With `end_stream` the call carries no client stream.
    pub async fn start_call<B: Serialize>(
        &self,
        opcode: Opcode,
        metadata: CallMetadata,
        body: &B,
        end_stream: bool,
    ) -> Result<ClientCall> {
        if self.reader.is_finished() {
            return Err(TransportError::ConnectionReset);
        }
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = metadata
            .timeout_ms
            .map(|ms| (Instant::now() + Duration::from_millis(ms), ms));
        let envelope = CallEnvelope {
            metadata,
            body: serialize_message(body)?,
        };
        let flags = if end_stream {
            FrameFlags::END_STREAM
        } else {
            FrameFlags::NONE
        };
        let frame = Frame::new(opcode, request_id, flags, serialize_message(&envelope)?);

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(request_id, tx);
        if let Err(e) = self.conn.send_frame(&frame).await {
            self.pending.remove(&request_id);
            return Err(e);
        }
        debug!(request_id, ?opcode, "call started");
        Ok(ClientCall {
            request_id,
            opcode,
            conn: self.conn.clone(),
            pending: self.pending.clone(),
            rx,
            deadline,
            sent_end: end_stream,
            finished: false,
        })
    }

    /// Sends a request without a client stream and decodes the reply.
    pub async fn unary<B: Serialize, T: DeserializeOwned>(
        &self,
        opcode: Opcode,
        metadata: CallMetadata,
        body: &B,
    ) -> Result<T> {
        let mut call = self.start_call(opcode, metadata, body, true).await?;
        loop {
            match call.recv().await? {
                CallEvent::Data(_) => continue,
                CallEvent::Reply(payload) => return decode_reply(&payload),
            }
        }
    }

    /// True while the reader task is alive.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One step of a call's response stream.
#[derive(Debug)]
pub enum CallEvent {
    /// Raw stream bytes.
    Data(Vec<u8>),
    /// Terminal reply payload; decode with [`decode_reply`].
    Reply(Vec<u8>),
}

/// Decodes a terminal payload, turning a remote status into `TransportError::Status`.
pub fn decode_reply<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let reply: RpcReply<Vec<u8>> = deserialize_message(payload)?;
    let body = reply?;
    deserialize_message(&body)
}

/// A call in progress.
///
/// Dropping an unfinished call sends a cancel frame so the server releases
/// whatever it holds for it.
pub struct ClientCall {
    request_id: u64,
    opcode: Opcode,
    conn: Arc<TcpConnection>,
    pending: Arc<PendingMap>,
    rx: mpsc::UnboundedReceiver<Frame>,
    deadline: Option<(Instant, u64)>,
    sent_end: bool,
    finished: bool,
}

impl ClientCall {
    /// Request id on the wire.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Sends one chunk of the client stream.
    pub async fn send_data(&self, chunk: &[u8]) -> Result<()> {
        let frame = Frame::new(self.opcode, self.request_id, FrameFlags::DATA, chunk.to_vec());
        self.conn.send_frame(&frame).await
    }

    /// Closes the client stream.
    pub async fn finish_send(&mut self) -> Result<()> {
        if self.sent_end {
            return Ok(());
        }
        let frame = Frame::new(self.opcode, self.request_id, FrameFlags::END_STREAM, Vec::new());
        self.conn.send_frame(&frame).await?;
        self.sent_end = true;
        Ok(())
    }

    /// Waits for the next response frame, honouring the call deadline.
    pub async fn recv(&mut self) -> Result<CallEvent> {
        let next = match self.deadline {
            Some((at, timeout_ms)) => match tokio::time::timeout_at(at, self.rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    self.cancel().await;
                    return Err(TransportError::RequestTimeout {
                        request_id: self.request_id,
                        timeout_ms,
                    });
                }
            },
            None => self.rx.recv().await,
        };
        let frame = next.ok_or(TransportError::ConnectionReset)?;
        self.classify(frame)
    }

    /// Returns a response frame if one already arrived, without waiting.
    ///
    /// Lets an uploader notice an early reply while it is still streaming.
    pub fn try_recv(&mut self) -> Option<Result<CallEvent>> {
        match self.rx.try_recv() {
            Ok(frame) => Some(self.classify(frame)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(TransportError::ConnectionReset)),
        }
    }

    fn classify(&mut self, frame: Frame) -> Result<CallEvent> {
        if frame.is_end_stream() {
            self.finished = true;
            return Ok(CallEvent::Reply(frame.payload));
        }
        if frame.is_data() {
            return Ok(CallEvent::Data(frame.payload));
        }
        Err(TransportError::InvalidFrame {
            reason: format!(
                "unexpected response flags 0x{:02X}",
                frame.header.flags.as_u8()
            ),
        })
    }

    /// Asks the server to abandon the call.
    pub async fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let frame = Frame::new(Opcode::Cancel, self.request_id, FrameFlags::NONE, Vec::new());
        if let Err(e) = self.conn.send_frame(&frame).await {
            debug!(request_id = self.request_id, error = %e, "cancel frame not delivered");
        }
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
        if self.finished {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let conn = self.conn.clone();
            let request_id = self.request_id;
            handle.spawn(async move {
                let frame = Frame::new(Opcode::Cancel, request_id, FrameFlags::NONE, Vec::new());
                let _ = conn.send_frame(&frame).await;
            });
        }
    }
}
