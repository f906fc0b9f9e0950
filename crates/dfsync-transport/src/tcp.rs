//! Framed TCP connections.
//!
//! A connection is split once: one reader task owns the receive side, while
//! any number of call tasks share the send side. Each frame goes out in a
//! single write under the send lock.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Time allowed for the TCP handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One framed connection to a peer.
pub struct TcpConnection {
    peer: String,
    rx: Mutex<BufReader<OwnedReadHalf>>,
    tx: Mutex<OwnedWriteHalf>,
}

impl TcpConnection {
    /// Dials `addr`, giving up after [`CONNECT_TIMEOUT`].
    pub async fn dial(addr: &str) -> Result<Self> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
                })
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                })
            }
            Ok(res) => res?,
        };
        debug!(addr, "dialed server");
        Self::from_stream(stream)
    }

    /// Wraps an accepted or dialed stream. Small frames are sent immediately.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => String::from("unknown"),
        };
        let (read, write) = stream.into_split();
        Ok(Self {
            peer,
            rx: Mutex::new(BufReader::new(read)),
            tx: Mutex::new(write),
        })
    }

    /// Remote address, for log fields.
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    /// Writes one frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        self.tx.lock().await.write_all(&bytes).await?;
        Ok(())
    }

    /// Reads the next frame.
    ///
    /// The peer closing between frames is `ConnectionReset`; closing inside
    /// a frame is an I/O error.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut rx = self.rx.lock().await;
        let mut head = [0u8; FRAME_HEADER_SIZE];
        match rx.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(TransportError::ConnectionReset),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&head)?;
        let len = header.payload_length;
        if len > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: len,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; len as usize];
        rx.read_exact(&mut payload).await?;
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }
}
