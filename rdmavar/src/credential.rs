//! Remote addressing.

use std::fmt;

use softrdma::QpInfo;

/// Address and remote key naming a region the peer exposes.
///
/// A credential is only meaningful while the connection that produced or
/// received it is open. After teardown the peer rejects its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Credential {
    /// Remote base address.
    pub addr: u64,
    /// Remote key.
    pub rkey: u32,
}

impl Credential {
    pub const fn new(addr: u64, rkey: u32) -> Self {
        Self { addr, rkey }
    }

    /// The same key, `bytes` further into the region. `None` on overflow.
    pub fn offset(self, bytes: u64) -> Option<Self> {
        Some(Self {
            addr: self.addr.checked_add(bytes)?,
            rkey: self.rkey,
        })
    }
}

impl From<QpInfo> for Credential {
    fn from(info: QpInfo) -> Self {
        Self::new(info.addr, info.rkey)
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr=0x{:x} rkey=0x{:x}", self.addr, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_keeps_key_and_checks_overflow() {
        let c = Credential::new(0x1000, 7);
        assert_eq!(c.offset(40), Some(Credential::new(0x1028, 7)));
        assert_eq!(Credential::new(u64::MAX - 1, 7).offset(2), None);
        assert_eq!(c.to_string(), "addr=0x1000 rkey=0x7");
    }
}
