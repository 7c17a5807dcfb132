//! Addressing types exchanged between peers.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Global Identifier (GID) for a port.
///
/// Derived from the IP address the connection is bound to:
/// - For IPv4: Uses IPv4-mapped IPv6 format (::ffff:x.x.x.x)
/// - For IPv6: Uses the IPv6 address directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid {
    /// Raw 128-bit GID value in network byte order
    pub raw: [u8; 16],
}

impl Gid {
    /// Create a new GID with all zeros.
    pub const fn zero() -> Self {
        Self { raw: [0u8; 16] }
    }

    /// Create a GID from raw bytes.
    pub const fn from_raw(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    /// Create a GID from an IPv4 address (IPv4-mapped IPv6 format).
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        Self {
            raw: ip.to_ipv6_mapped().octets(),
        }
    }

    /// Create a GID from an IPv6 address.
    pub fn from_ipv6(ip: Ipv6Addr) -> Self {
        Self { raw: ip.octets() }
    }

    /// Check if this GID is all zeros.
    pub fn is_zero(&self) -> bool {
        self.raw == [0u8; 16]
    }
}

impl From<IpAddr> for Gid {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::from_ipv4(v4),
            IpAddr::V6(v6) => Self::from_ipv6(v6),
        }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = Ipv6Addr::from(self.raw);
        match ip.to_ipv4_mapped() {
            Some(v4) => write!(f, "::ffff:{v4}"),
            None => write!(f, "{ip}"),
        }
    }
}

/// Endpoint record exchanged during connection setup.
///
/// Names the sender's queue pair and the memory region it exposes to the
/// peer: `addr` is the base address and `rkey` the remote key of that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpInfo {
    /// Queue pair number of the sender.
    pub qp_number: u32,
    /// GID of the sender.
    pub gid: Gid,
    /// Base address of the exposed region.
    pub addr: u64,
    /// Remote key of the exposed region.
    pub rkey: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct QpInfoWire {
    qp_number: U32,
    rkey: U32,
    addr: U64,
    gid: [u8; 16],
}

/// Size of [`QpInfo`] on the wire.
pub const QP_INFO_SIZE: usize = std::mem::size_of::<QpInfoWire>();

impl QpInfo {
    /// Create a new record.
    pub fn new(qp_number: u32, gid: Gid, addr: u64, rkey: u32) -> Self {
        Self {
            qp_number,
            gid,
            addr,
            rkey,
        }
    }

    /// Encode into the fixed little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; QP_INFO_SIZE] {
        let wire = QpInfoWire {
            qp_number: U32::new(self.qp_number),
            rkey: U32::new(self.rkey),
            addr: U64::new(self.addr),
            gid: self.gid.raw,
        };
        let mut out = [0u8; QP_INFO_SIZE];
        out.copy_from_slice(wire.as_bytes());
        out
    }

    /// Decode from the wire layout.
    ///
    /// # Errors
    /// Returns `InvalidData` if `bytes` is not exactly [`QP_INFO_SIZE`] long
    /// or names queue pair 0.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let wire = QpInfoWire::read_from_bytes(bytes).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("endpoint record must be {QP_INFO_SIZE} bytes, got {}", bytes.len()),
            )
        })?;
        if wire.qp_number.get() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "endpoint record names queue pair 0",
            ));
        }
        Ok(Self {
            qp_number: wire.qp_number.get(),
            gid: Gid::from_raw(wire.gid),
            addr: wire.addr.get(),
            rkey: wire.rkey.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_info_layout() {
        assert_eq!(QP_INFO_SIZE, 32);
        let info = QpInfo::new(0x12, Gid::from_ipv4(Ipv4Addr::LOCALHOST), 0xdead_beef_0000, 0x55);
        let bytes = info.to_bytes();
        assert_eq!(&bytes[0..4], &0x12u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x55u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0xdead_beef_0000u64.to_le_bytes());
        assert_eq!(QpInfo::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn qp_info_rejects_bad_records() {
        let err = QpInfo::from_bytes(&[0u8; 31]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = QpInfo::from_bytes(&[0u8; QP_INFO_SIZE]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn gid_display() {
        assert_eq!(Gid::from_ipv4(Ipv4Addr::new(10, 0, 0, 1)).to_string(), "::ffff:10.0.0.1");
        assert_eq!(Gid::from_ipv6(Ipv6Addr::LOCALHOST).to_string(), "::1");
        assert!(Gid::zero().is_zero());
    }
}
