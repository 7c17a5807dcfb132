//! Connection manager.
//!
//! A [`Connection`] owns one endpoint to one peer. Construction runs the whole
//! handshake:
//!
//! ```text
//! Uninitialized -> Handshaking -> Ready -> Closed
//!                       |                    ^
//!                       +-------(failure)----+
//! ```
//!
//! 1. create the endpoint (connect or accept)
//! 2. allocate and register the working buffer (exposed to the peer) and the
//!    staging buffer (private)
//! 3. exchange endpoint records; the peer's record becomes the remote region
//!
//! Only a `Ready` connection is ever returned. A failed handshake releases
//! the endpoint and surfaces [`Error::Connection`].
//!
//! ## Operations
//!
//! Every READ/WRITE is synchronous: stage, post, wait for the completion,
//! copy out. An internal mutex makes calls from several threads mutually
//! exclusive, so at most one operation is ever outstanding and operations
//! from one thread complete in issue order. There is no timeout; a stalled
//! peer blocks the caller.
//!
//! A failed operation is reported to the caller and leaves the connection
//! `Ready`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use softrdma::{AccessFlags, MemoryRegion, Opcode, QpInfo, WorkRequest};

use crate::buffer::AlignedBuffer;
use crate::config::{ConnectionBuilder, ConnectionConfig, Mode};
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::transport::{Role, SoftRdma, Transport};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructor entered, nothing acquired yet.
    Uninitialized,
    /// Endpoint created, credentials being exchanged.
    Handshaking,
    /// Credentials exchanged; operations allowed.
    Ready,
    /// Torn down, or the handshake failed.
    Closed,
}

struct Inner<X> {
    state: ConnectionState,
    // Field order is drop order: endpoint, then registrations, then memory.
    transport: X,
    exposed_mr: Option<MemoryRegion>,
    staging_mr: Option<MemoryRegion>,
    exposed: AlignedBuffer,
    staging: AlignedBuffer,
    posted: u64,
}

/// One endpoint of a point-to-point RDMA connection.
///
/// Share it by reference; proxies borrow it and cannot outlive it.
pub struct Connection<X: Transport = SoftRdma> {
    role: &'static str,
    mode: Mode,
    local: QpInfo,
    remote: QpInfo,
    max_transfer: usize,
    inner: Mutex<Inner<X>>,
}

impl Connection {
    /// Connect to `peer` with default settings.
    pub fn client(peer: &str, mode: Mode) -> Result<Self> {
        Self::builder().mode(mode).connect(peer)
    }

    /// Accept one peer on the default port with default settings.
    pub fn server(mode: Mode) -> Result<Self> {
        Self::builder().mode(mode).accept()
    }

    /// Builder for the TCP software transport.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }
}

impl<X: Transport> Connection<X> {
    pub(crate) fn establish(role: Role, config: ConnectionConfig, seed: &[u8]) -> Result<Self> {
        let role_name = role.name();
        let mut state = ConnectionState::Uninitialized;
        tracing::debug!(role = role_name, ?state, "creating connection");

        if config.buffer_size == 0 {
            return Err(Error::invalid("buffer size must be non-zero"));
        }
        if config.buffer_size > softrdma::wire::MAX_PAYLOAD as usize {
            return Err(Error::invalid(format!(
                "buffer size {} exceeds the transport maximum {}",
                config.buffer_size,
                softrdma::wire::MAX_PAYLOAD
            )));
        }
        if seed.len() > config.buffer_size {
            return Err(Error::invalid(format!(
                "seed of {} bytes does not fit a {}-byte buffer",
                seed.len(),
                config.buffer_size
            )));
        }

        let mut exposed =
            AlignedBuffer::new(config.buffer_size).map_err(|e| Error::connection("allocate buffer", e))?;
        let staging =
            AlignedBuffer::new(config.buffer_size).map_err(|e| Error::connection("allocate buffer", e))?;
        exposed.fill_at(0, seed);

        let mut transport =
            X::create_endpoint(role, &config).map_err(|e| Error::connection("create endpoint", e))?;
        state = ConnectionState::Handshaking;
        tracing::info!(role = role_name, transport = X::NAME, ?state, "endpoint created");

        match handshake(&mut transport, &config, &exposed, &staging) {
            Ok((local, remote, exposed_mr, staging_mr)) => {
                state = ConnectionState::Ready;
                tracing::info!(
                    role = role_name,
                    ?state,
                    local_addr = local.addr,
                    local_rkey = local.rkey,
                    remote_addr = remote.addr,
                    remote_rkey = remote.rkey,
                    "connection ready"
                );
                Ok(Self {
                    role: role_name,
                    mode: config.mode,
                    local,
                    remote,
                    max_transfer: config.buffer_size,
                    inner: Mutex::new(Inner {
                        state,
                        transport,
                        exposed_mr: Some(exposed_mr),
                        staging_mr: Some(staging_mr),
                        exposed,
                        staging,
                        posted: 0,
                    }),
                })
            }
            Err(e) => {
                transport.teardown();
                tracing::warn!(role = role_name, error = %e, "handshake failed");
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<X>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Operating mode chosen at construction.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Largest transfer a single call accepts.
    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer
    }

    /// Number of work requests handed to the transport so far.
    pub fn posted_operations(&self) -> u64 {
        self.lock().posted
    }

    // -------------------------------------------------------------------------
    // Remote operations
    // -------------------------------------------------------------------------

    /// READ `buf.len()` bytes at `offset` into the negotiated remote region.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let addr = self.remote_addr(offset)?;
        self.read_at(buf, addr, self.remote.rkey)
    }

    /// READ `buf.len()` bytes from an explicit remote address and key.
    pub fn read_at(&self, buf: &mut [u8], addr: u64, rkey: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.check_ready()?;
        self.check_len(buf.len())?;
        inner.execute(Opcode::RdmaRead, buf.len(), addr, rkey)?;
        inner.staging.read_at(0, buf);
        Ok(())
    }

    /// WRITE `buf` at `offset` into the negotiated remote region.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let addr = self.remote_addr(offset)?;
        self.write_at(buf, addr, self.remote.rkey)
    }

    /// WRITE `buf` to an explicit remote address and key.
    pub fn write_at(&self, buf: &[u8], addr: u64, rkey: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.check_ready()?;
        self.check_len(buf.len())?;
        inner.staging.fill_at(0, buf);
        inner.execute(Opcode::RdmaWrite, buf.len(), addr, rkey)
    }

    fn remote_addr(&self, offset: u64) -> Result<u64> {
        self.remote.addr.checked_add(offset).ok_or_else(|| {
            Error::invalid(format!(
                "offset {offset} overflows remote base 0x{:x}",
                self.remote.addr
            ))
        })
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::invalid("zero-length transfer"));
        }
        if len > self.max_transfer {
            return Err(Error::invalid(format!(
                "transfer of {len} bytes exceeds the maximum of {}",
                self.max_transfer
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Local working buffer
    // -------------------------------------------------------------------------

    /// Copy out of this side's working buffer, the memory the peer sees.
    ///
    /// The peer may be writing the same bytes concurrently; no ordering with
    /// remote WRITEs is implied.
    pub fn read_local(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let inner = self.lock();
        inner.check_ready()?;
        self.check_local_range(offset, buf.len())?;
        inner.exposed.read_at(offset, buf);
        Ok(())
    }

    /// Copy into this side's working buffer.
    pub fn write_local(&self, buf: &[u8], offset: usize) -> Result<()> {
        let mut inner = self.lock();
        inner.check_ready()?;
        self.check_local_range(offset, buf.len())?;
        inner.exposed.fill_at(offset, buf);
        Ok(())
    }

    fn check_local_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.max_transfer => Ok(()),
            _ => Err(Error::invalid(format!(
                "range {offset}+{len} outside the {}-byte working buffer",
                self.max_transfer
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Region info
    // -------------------------------------------------------------------------

    /// This side's endpoint record, optionally re-based to `addr` (for
    /// advertising a buffer other than the working buffer).
    pub fn local_region_info(&self, addr: Option<u64>) -> QpInfo {
        match addr {
            Some(addr) => QpInfo { addr, ..self.local },
            None => self.local,
        }
    }

    /// The peer's endpoint record received in the handshake.
    pub fn remote_region_info(&self) -> QpInfo {
        self.remote
    }

    /// Address and key of the negotiated remote region.
    pub fn remote_credential(&self) -> Credential {
        Credential::from(self.remote)
    }

    /// Address and key of this side's working buffer.
    pub fn local_credential(&self) -> Credential {
        Credential::from(self.local)
    }

    /// Expose another local buffer to the peer.
    ///
    /// Returns `None` for a null address, zero length, or any other refusal
    /// by the substrate. The region is deregistered when dropped.
    ///
    /// # Safety
    /// `[addr, addr + len)` must stay valid and in place while the returned
    /// region lives, and concurrent remote access to it must be acceptable.
    pub unsafe fn register_memory(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Option<MemoryRegion> {
        if addr.is_null() || len == 0 {
            tracing::warn!(len, "refusing to register a null or empty region");
            return None;
        }
        let inner = self.lock();
        if inner.state != ConnectionState::Ready {
            return None;
        }
        match unsafe { inner.transport.register_region(addr, len, access) } {
            Ok(mr) => Some(mr),
            Err(e) => {
                tracing::warn!(len, error = %e, "memory registration failed");
                None
            }
        }
    }

    /// Tear the connection down. Idempotent; later operations fail with
    /// [`Error::NotReady`].
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.transport.teardown();
        inner.exposed_mr = None;
        inner.staging_mr = None;
        inner.state = ConnectionState::Closed;
        tracing::info!(role = self.role, posted = inner.posted, "connection closed");
    }
}

impl<X: Transport> Drop for Connection<X> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<X: Transport> std::fmt::Debug for Connection<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("local", &self.local_credential())
            .field("remote", &self.remote_credential())
            .field("state", &self.state())
            .finish()
    }
}

/// Register both buffers and exchange records. Registrations are returned
/// only when the whole exchange succeeded.
fn handshake<X: Transport>(
    transport: &mut X,
    config: &ConnectionConfig,
    exposed: &AlignedBuffer,
    staging: &AlignedBuffer,
) -> Result<(QpInfo, QpInfo, MemoryRegion, MemoryRegion)> {
    let exposed_mr = unsafe {
        transport.register_region(exposed.as_ptr(), config.buffer_size, config.mode.access_flags())
    }
    .map_err(|e| Error::connection("register working buffer", e))?;
    let staging_mr = unsafe {
        transport.register_region(staging.as_ptr(), config.buffer_size, AccessFlags::LOCAL_WRITE)
    }
    .map_err(|e| Error::connection("register staging buffer", e))?;

    let (qp_number, gid) = transport.local_endpoint();
    let local = QpInfo::new(qp_number, gid, exposed.addr(), exposed_mr.rkey());
    let remote = transport
        .exchange_credentials(&local)
        .map_err(|e| Error::connection("exchange credentials", e))?;
    Ok((local, remote, exposed_mr, staging_mr))
}

impl<X: Transport> Inner<X> {
    fn check_ready(&self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            state => Err(Error::NotReady(state)),
        }
    }

    /// Post one operation on the staging buffer and wait for its completion.
    fn execute(&mut self, opcode: Opcode, len: usize, addr: u64, rkey: u32) -> Result<()> {
        let op = match opcode {
            Opcode::RdmaRead => "read",
            Opcode::RdmaWrite => "write",
        };
        let Some(mr) = self.staging_mr.as_ref() else {
            return Err(Error::NotReady(self.state));
        };
        // `len` was checked against the buffer size, which fits in u32.
        let len = len as u32;
        let wr_id = self.posted + 1;
        let wr = match opcode {
            Opcode::RdmaRead => WorkRequest::read(wr_id, mr.addr(), mr.lkey(), len, addr, rkey),
            Opcode::RdmaWrite => WorkRequest::write(wr_id, mr.addr(), mr.lkey(), len, addr, rkey),
        };

        self.posted = wr_id;
        tracing::debug!(op, wr_id, remote_addr = addr, rkey, len, "posting");
        self.transport
            .post_operation(&wr)
            .map_err(|e| Error::remote(op, e))?;
        let wc = self
            .transport
            .wait_completion()
            .map_err(|e| Error::remote(op, e))?;

        if wc.wr_id != wr_id {
            tracing::warn!(op, expected = wr_id, got = wc.wr_id, "completion for another request");
            return Err(Error::remote(
                op,
                format!("completion for wr_id {} while waiting for {wr_id}", wc.wr_id),
            ));
        }
        if !wc.status.is_success() {
            tracing::warn!(op, wr_id, remote_addr = addr, rkey, status = %wc.status, "operation failed");
            return Err(Error::remote(op, wc.status));
        }
        Ok(())
    }
}
