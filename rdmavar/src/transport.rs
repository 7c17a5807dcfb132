//! Transport substrate seen by a [`Connection`](crate::Connection).
//!
//! The connection needs six primitives from whatever moves the bytes:
//! create an endpoint, register memory, exchange endpoint records, post one
//! READ or WRITE, wait for its completion, and tear the endpoint down.
//! [`Transport`] names exactly those. [`SoftRdma`] implements it on top of
//! the `softrdma` software verbs.

use std::io;
use std::net::TcpListener;

use softrdma::{
    AccessFlags, Gid, MemoryRegion, ProtectionDomain, QpInfo, QueuePair, WorkCompletion,
    WorkRequest,
};

use crate::config::ConnectionConfig;

// =============================================================================
// Role
// =============================================================================

/// Which side of the handshake an endpoint plays.
#[derive(Debug)]
pub enum Role {
    /// Connect out to a named peer (`host` or `host:port`).
    Client { peer: String },
    /// Accept one peer, on the given listener or on `config.port`.
    Server { listener: Option<TcpListener> },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Client { .. } => "client",
            Role::Server { .. } => "server",
        }
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Substrate operations consumed by the connection manager.
///
/// Every method maps to one substrate primitive; the connection never holds
/// more than one posted operation at a time.
pub trait Transport: Send + Sized {
    /// Human-readable name for logs.
    const NAME: &'static str;

    /// Create a connected endpoint for `role`.
    fn create_endpoint(role: Role, config: &ConnectionConfig) -> io::Result<Self>;

    /// Queue pair number and GID advertised in the endpoint record.
    fn local_endpoint(&self) -> (u32, Gid);

    /// Register `[addr, addr + len)` for access under `access`.
    ///
    /// # Safety
    /// The memory must stay valid and in place for the lifetime of the
    /// returned region.
    unsafe fn register_region(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion>;

    /// Send `local` and receive the peer's record.
    fn exchange_credentials(&mut self, local: &QpInfo) -> io::Result<QpInfo>;

    /// Post one READ or WRITE.
    fn post_operation(&mut self, wr: &WorkRequest) -> io::Result<()>;

    /// Block until the next completion.
    fn wait_completion(&mut self) -> io::Result<WorkCompletion>;

    /// Release the endpoint. Must be idempotent.
    fn teardown(&mut self);
}

// =============================================================================
// SoftRdma
// =============================================================================

/// Software RDMA over TCP: one protection domain and one RC queue pair.
pub struct SoftRdma {
    // Dropped first so the responder stops before the domain goes away.
    qp: QueuePair,
    pd: ProtectionDomain,
}

impl SoftRdma {
    /// The underlying queue pair.
    pub fn queue_pair(&self) -> &QueuePair {
        &self.qp
    }
}

impl Transport for SoftRdma {
    const NAME: &'static str = "softrdma";

    fn create_endpoint(role: Role, config: &ConnectionConfig) -> io::Result<Self> {
        let pd = ProtectionDomain::new();
        let qp = match role {
            Role::Client { peer } => QueuePair::connect(&peer, config.port, &pd)?,
            Role::Server {
                listener: Some(listener),
            } => QueuePair::accept(&listener, &pd)?,
            Role::Server { listener: None } => QueuePair::listen(config.port, &pd)?,
        };
        Ok(Self { qp, pd })
    }

    fn local_endpoint(&self) -> (u32, Gid) {
        (self.qp.qp_number(), self.qp.gid())
    }

    unsafe fn register_region(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        unsafe { self.pd.register(addr, len, access) }
    }

    fn exchange_credentials(&mut self, local: &QpInfo) -> io::Result<QpInfo> {
        self.qp.exchange_info(local)
    }

    fn post_operation(&mut self, wr: &WorkRequest) -> io::Result<()> {
        self.qp.post(wr)
    }

    fn wait_completion(&mut self) -> io::Result<WorkCompletion> {
        self.qp.wait_completion()
    }

    fn teardown(&mut self) {
        self.qp.destroy();
    }
}
