//! Frame protocol for dfsync RPC.
//!
//! Every frame carries a fixed 24-byte big-endian header followed by the
//! payload. The header checksum is the CRC-32 of the payload and is verified
//! on receive.

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + flags:1 + opcode:2 + request_id:8 + payload_length:4 + checksum:4)
pub const FRAME_HEADER_SIZE: usize = 24;

/// Protocol magic number for frame validation
pub const MAGIC: u32 = 0xDF5C0001;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted on receive (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Operations in the dfsync RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Acquire the write lock for a filename.
    AcquireWriteLock = 0x0101,
    /// Client-streamed upload.
    WriteFile = 0x0102,
    /// Server-streamed download.
    GetFile = 0x0103,
    /// Remove a file.
    DeleteFile = 0x0104,
    /// Enumerate the mount directory.
    ListFiles = 0x0105,
    /// Stat one file.
    GetFileStatus = 0x0106,
    /// Asynchronous "what changed" request.
    CallbackList = 0x0201,
    /// Cancel an in-flight call with the same request id.
    Cancel = 0x0F01,
}

impl Opcode {
    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Opcode {
    type Error = TransportError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0x0101 => Opcode::AcquireWriteLock,
            0x0102 => Opcode::WriteFile,
            0x0103 => Opcode::GetFile,
            0x0104 => Opcode::DeleteFile,
            0x0105 => Opcode::ListFiles,
            0x0106 => Opcode::GetFileStatus,
            0x0201 => Opcode::CallbackList,
            0x0F01 => Opcode::Cancel,
            other => return Err(TransportError::UnknownOpcode(other)),
        })
    }
}

/// Frame control bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: FrameFlags = FrameFlags(0);
    /// Frame travels server to client.
    pub const RESPONSE: FrameFlags = FrameFlags(0x01);
    /// Last frame of this direction of the call.
    pub const END_STREAM: FrameFlags = FrameFlags(0x02);
    /// Payload is raw stream bytes rather than an envelope or reply.
    pub const DATA: FrameFlags = FrameFlags(0x04);

    /// Builds flags from the raw byte.
    pub fn from_u8(b: u8) -> Self {
        FrameFlags(b)
    }

    /// Raw byte.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// True if every bit in `other` is set.
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Frame header containing metadata about the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Control flags
    pub flags: FrameFlags,
    /// Operation code
    pub opcode: Opcode,
    /// Request ID for multiplexing
    pub request_id: u64,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 checksum of payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Serializes the header into its fixed wire layout.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.flags.as_u8();
        buf[6..8].copy_from_slice(&self.opcode.as_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parses a header, rejecting bad magic, versions and opcodes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header too short: {} bytes", buf.len()),
            });
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_u8(buf[5]);
        let opcode = Opcode::try_from(u16::from_be_bytes([buf[6], buf[7]]))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);
        let request_id = u64::from_be_bytes(id);
        let payload_length = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let checksum = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        Ok(Self {
            magic,
            version,
            flags,
            opcode,
            request_id,
            payload_length,
            checksum,
        })
    }
}

/// A single frame in the RPC protocol
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame, filling in length and payload checksum.
    pub fn new(opcode: Opcode, request_id: u64, flags: FrameFlags, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            opcode,
            request_id,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Header plus payload as one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Checks length and payload checksum against the header.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() as u64 != self.header.payload_length as u64 {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    self.payload.len(),
                    self.header.payload_length
                ),
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Request id.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Opcode.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// True for server-to-client frames.
    pub fn is_response(&self) -> bool {
        self.header.flags.contains(FrameFlags::RESPONSE)
    }

    /// True for the last frame in its direction.
    pub fn is_end_stream(&self) -> bool {
        self.header.flags.contains(FrameFlags::END_STREAM)
    }

    /// True for raw stream-data frames.
    pub fn is_data(&self) -> bool {
        self.header.flags.contains(FrameFlags::DATA)
    }
}
