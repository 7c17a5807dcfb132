//! Work completions.
//!
//! Each posted work request produces exactly one [`WorkCompletion`], returned
//! by [`QueuePair::wait_completion`](crate::QueuePair::wait_completion) in
//! the order the requests were posted.

use std::fmt;

/// Operation carried by a work request / completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// One-sided read of peer memory into local memory.
    RdmaRead = 0,
    /// One-sided write of local memory into peer memory.
    RdmaWrite = 1,
}

/// Completion status.
///
/// Values follow the `ibv_wc_status` numbering for the statuses this
/// transport can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WcStatus {
    /// Operation completed successfully.
    Success = 0,
    /// Local SGE exceeded its memory region.
    LocalLengthError = 1,
    /// Local lkey invalid or lacking rights for the operation.
    LocalProtectionError = 4,
    /// Work request flushed because the queue pair left RTS.
    WrFlushError = 5,
    /// Peer rejected the rkey, range or rights of the request.
    RemoteAccessError = 10,
    /// Peer could not execute the request.
    RemoteOperationError = 11,
}

impl WcStatus {
    /// Convert from the wire encoding.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::LocalLengthError),
            4 => Some(Self::LocalProtectionError),
            5 => Some(Self::WrFlushError),
            10 => Some(Self::RemoteAccessError),
            11 => Some(Self::RemoteOperationError),
            _ => None,
        }
    }

    /// Returns true for [`WcStatus::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::LocalLengthError => "local length error",
            Self::LocalProtectionError => "local protection error",
            Self::WrFlushError => "work request flushed",
            Self::RemoteAccessError => "remote access error",
            Self::RemoteOperationError => "remote operation error",
        };
        f.write_str(s)
    }
}

/// Completion of one work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// `wr_id` of the completed work request.
    pub wr_id: u64,
    /// Operation of the completed work request.
    pub opcode: Opcode,
    /// Completion status.
    pub status: WcStatus,
    /// Bytes transferred (0 unless successful).
    pub byte_len: u32,
}

impl WorkCompletion {
    pub(crate) fn flushed(wr_id: u64, opcode: Opcode) -> Self {
        Self {
            wr_id,
            opcode,
            status: WcStatus::WrFlushError,
            byte_len: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_values() {
        for status in [
            WcStatus::Success,
            WcStatus::LocalLengthError,
            WcStatus::LocalProtectionError,
            WcStatus::WrFlushError,
            WcStatus::RemoteAccessError,
            WcStatus::RemoteOperationError,
        ] {
            assert_eq!(WcStatus::from_u8(status as u8), Some(status));
        }
        assert_eq!(WcStatus::from_u8(2), None);
        assert!(WcStatus::Success.is_success());
        assert!(!WcStatus::RemoteAccessError.is_success());
    }
}
