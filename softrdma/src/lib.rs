//! # softrdma - Software RDMA verbs over TCP
//!
//! This crate emulates the small slice of the verbs interface needed for
//! one-sided RDMA on a reliable connection, without an RDMA-capable NIC.
//!
//! ## Model
//!
//! - **Protection Domain (PD)**: owns the table of registered memory regions.
//!   Every region gets an `lkey` (used when posting) and an `rkey` (handed to
//!   the peer).
//! - **Queue Pair (QP)**: one side of a reliable connection. A background
//!   responder thread plays the role of the remote NIC: it serves READ and
//!   WRITE requests from the peer directly against registered memory, and it
//!   delivers completions for this side's own requests.
//! - **Completion Queue (CQ)**: completions are returned in posting order by
//!   [`QueuePair::wait_completion`]. Data of a READ is visible in local memory
//!   before its completion is returned.
//!
//! ## Usage
//!
//! ```ignore
//! let pd = ProtectionDomain::new();
//! let mr = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ)? };
//!
//! let mut qp = QueuePair::connect("server:18515", DEFAULT_PORT, &pd)?;
//! let remote = qp.exchange_info(&QpInfo::new(qp.qp_number(), qp.gid(), mr.addr() as u64, mr.rkey()))?;
//!
//! qp.post(&WorkRequest::read(1, mr.addr(), mr.lkey(), 8, remote.addr, remote.rkey))?;
//! let wc = qp.wait_completion()?;
//! ```

pub mod cq;
pub mod pd;
pub mod qp;
pub mod types;
pub mod wire;

pub use cq::{Opcode, WcStatus, WorkCompletion};
pub use pd::{AccessFlags, MemoryRegion, ProtectionDomain};
pub use qp::{QpState, QueuePair, WorkRequest};
pub use types::{Gid, QpInfo, QP_INFO_SIZE};

/// Default TCP port used for the connection when the peer string has none.
pub const DEFAULT_PORT: u16 = 18515;
