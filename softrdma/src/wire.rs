//! Frame encoding for requests and responses on an established connection.
//!
//! Every frame starts with a fixed 32-byte little-endian header:
//!
//! | offset | size | field         |
//! |--------|------|---------------|
//! | 0      | 1    | kind          |
//! | 1      | 1    | status        |
//! | 2      | 2    | padding       |
//! | 4      | 4    | len           |
//! | 8      | 8    | wr_id         |
//! | 16     | 8    | remote_addr   |
//! | 24     | 4    | rkey          |
//! | 28     | 4    | padding       |
//!
//! `len` payload bytes follow a WRITE request and a successful READ response.

use std::io::{self, Read, Write};

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::cq::WcStatus;

/// Size of a frame header in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// Largest payload accepted in one frame (1 GiB).
pub const MAX_PAYLOAD: u32 = 1 << 30;

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    ReadRequest = 1,
    ReadResponse = 2,
    WriteRequest = 3,
    WriteResponse = 4,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::ReadResponse),
            3 => Some(Self::WriteRequest),
            4 => Some(Self::WriteResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    kind: u8,
    status: u8,
    _padding: [u8; 2],
    len: U32,
    wr_id: U64,
    remote_addr: U64,
    rkey: U32,
    _padding2: [u8; 4],
}

impl FrameHeader {
    fn new(kind: FrameKind, status: WcStatus, wr_id: u64, remote_addr: u64, rkey: u32, len: u32) -> Self {
        Self {
            kind: kind as u8,
            status: status as u8,
            _padding: [0; 2],
            len: U32::new(len),
            wr_id: U64::new(wr_id),
            remote_addr: U64::new(remote_addr),
            rkey: U32::new(rkey),
            _padding2: [0; 4],
        }
    }

    /// READ request for `len` bytes at `remote_addr` under `rkey`.
    pub fn read_request(wr_id: u64, remote_addr: u64, rkey: u32, len: u32) -> Self {
        Self::new(FrameKind::ReadRequest, WcStatus::Success, wr_id, remote_addr, rkey, len)
    }

    /// WRITE request; `len` payload bytes follow.
    pub fn write_request(wr_id: u64, remote_addr: u64, rkey: u32, len: u32) -> Self {
        Self::new(FrameKind::WriteRequest, WcStatus::Success, wr_id, remote_addr, rkey, len)
    }

    /// READ response; carries `len` payload bytes only on success.
    pub fn read_response(wr_id: u64, status: WcStatus, len: u32) -> Self {
        let len = if status.is_success() { len } else { 0 };
        Self::new(FrameKind::ReadResponse, status, wr_id, 0, 0, len)
    }

    /// WRITE response; `len` is the number of bytes written.
    pub fn write_response(wr_id: u64, status: WcStatus, len: u32) -> Self {
        Self::new(FrameKind::WriteResponse, status, wr_id, 0, 0, len)
    }

    pub fn kind(&self) -> io::Result<FrameKind> {
        FrameKind::from_u8(self.kind).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {}", self.kind),
            )
        })
    }

    pub fn status(&self) -> WcStatus {
        WcStatus::from_u8(self.status).unwrap_or(WcStatus::RemoteOperationError)
    }

    pub fn wr_id(&self) -> u64 {
        self.wr_id.get()
    }

    pub fn remote_addr(&self) -> u64 {
        self.remote_addr.get()
    }

    pub fn rkey(&self) -> u32 {
        self.rkey.get()
    }

    pub fn len(&self) -> u32 {
        self.len.get()
    }

    /// Number of payload bytes following this header.
    pub fn payload_len(&self) -> usize {
        match FrameKind::from_u8(self.kind) {
            Some(FrameKind::WriteRequest) => self.len() as usize,
            Some(FrameKind::ReadResponse) if self.status().is_success() => self.len() as usize,
            _ => 0,
        }
    }
}

/// Write one frame. The header and payload go out in a single buffered write.
pub fn write_frame<W: Write>(w: &mut W, header: &FrameHeader, payload: &[u8]) -> io::Result<()> {
    debug_assert_eq!(header.payload_len(), payload.len());
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    w.write_all(&frame)?;
    w.flush()
}

/// Read one frame header, validating its kind and payload size.
pub fn read_header<R: Read>(r: &mut R) -> io::Result<FrameHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf)?;
    let header = FrameHeader::read_from_bytes(&buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))?;
    header.kind()?;
    if header.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds {}", header.len(), MAX_PAYLOAD),
        ));
    }
    Ok(header)
}

/// Read the payload announced by `header`.
pub fn read_payload<R: Read>(r: &mut R, header: &FrameHeader) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; header.payload_len()];
    r.read_exact(&mut payload)?;
    Ok(payload)
}
