#![warn(missing_docs)]

//! dfsync transport subsystem: framed RPC over TCP
//!
//! Calls are multiplexed over one connection by request id. A call opens with
//! an envelope frame carrying [`CallMetadata`], may stream raw chunks in either
//! direction, and always ends with one terminal reply frame holding either the
//! encoded result or an [`RpcStatus`].

pub mod client;
pub mod deadline;
#[allow(missing_docs)]
pub mod error;
pub mod message;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod status;
pub mod tcp;

pub use client::{decode_reply, CallEvent, ClientCall, RpcClient};
pub use deadline::{Deadline, DeadlineContext};
pub use error::{Result, TransportError};
pub use message::{
    deserialize_message, serialize_message, CallEnvelope, CallMetadata, Empty, FileAck, FileList,
    FileRequest, FileStatus,
};
pub use protocol::{Frame, FrameFlags, FrameHeader, Opcode, FRAME_HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};
pub use rpc::CallContext;
pub use server::{encode_body, CallHandler, Inbound, ResponseSink, RpcServer, ServerCall, INBOUND_BUFFER};
pub use status::{RpcReply, RpcStatus, StatusCode};
pub use tcp::{TcpConnection, CONNECT_TIMEOUT};
