//! Reliable Connected (RC) Queue Pair over TCP.
//!
//! A [`QueuePair`] is one side of a point-to-point connection. Its lifecycle
//! mirrors the verbs state machine:
//!
//! ```text
//! connect()/accept() -> Init --exchange_info()--> Rts --destroy()/peer loss--> Error
//! ```
//!
//! Once in RTS a responder thread owns the read half of the socket. It serves
//! the peer's READ/WRITE requests against the local protection domain and
//! turns responses to this side's requests into [`WorkCompletion`]s.
//! Responses are handed to a separate sender thread, so the responder keeps
//! draining the socket while a large READ response is in flight.

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::cq::{Opcode, WcStatus, WorkCompletion};
use crate::pd::{AccessFlags, ProtectionDomain, RegionTable};
use crate::types::{Gid, QP_INFO_SIZE, QpInfo};
use crate::wire::{self, FrameHeader, FrameKind, MAX_PAYLOAD};

/// QP numbers are 24 bits wide.
const QP_NUMBER_MASK: u32 = 0x00FF_FFFF;

static NEXT_QP_NUMBER: AtomicU32 = AtomicU32::new(0x100);

fn alloc_qp_number() -> u32 {
    loop {
        let qpn = NEXT_QP_NUMBER.fetch_add(1, Ordering::Relaxed) & QP_NUMBER_MASK;
        if qpn != 0 {
            return qpn;
        }
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Transport connected, endpoint records not yet exchanged.
    Init,
    /// Ready to send: work requests may be posted.
    Rts,
    /// Destroyed or failed; every outstanding request has been flushed.
    Error,
}

/// One-sided work request.
///
/// `local_addr`/`lkey`/`len` form the local scatter/gather entry and must lie
/// inside a memory region registered on the queue pair's protection domain.
#[derive(Debug, Clone, Copy)]
pub struct WorkRequest {
    /// User-defined identifier returned in the completion.
    pub wr_id: u64,
    /// READ or WRITE.
    pub opcode: Opcode,
    /// Local buffer address.
    pub local_addr: *mut u8,
    /// Local key of the region containing the local buffer.
    pub lkey: u32,
    /// Transfer length in bytes.
    pub len: u32,
    /// Peer address.
    pub remote_addr: u64,
    /// Peer remote key.
    pub rkey: u32,
}

impl WorkRequest {
    /// RDMA READ of `len` bytes from `remote_addr` into `local_addr`.
    pub fn read(wr_id: u64, local_addr: *mut u8, lkey: u32, len: u32, remote_addr: u64, rkey: u32) -> Self {
        Self {
            wr_id,
            opcode: Opcode::RdmaRead,
            local_addr,
            lkey,
            len,
            remote_addr,
            rkey,
        }
    }

    /// RDMA WRITE of `len` bytes from `local_addr` to `remote_addr`.
    pub fn write(wr_id: u64, local_addr: *mut u8, lkey: u32, len: u32, remote_addr: u64, rkey: u32) -> Self {
        Self {
            wr_id,
            opcode: Opcode::RdmaWrite,
            local_addr,
            lkey,
            len,
            remote_addr,
            rkey,
        }
    }
}

/// Outstanding request awaiting its response.
#[derive(Debug, Clone, Copy)]
struct Pending {
    opcode: Opcode,
    local_addr: u64,
    lkey: u32,
    len: u32,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// Response frame queued for the sender thread.
type Outgoing = (FrameHeader, Vec<u8>);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve(peer: &str, default_port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs = match peer.to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(_) => (peer, default_port).to_socket_addrs()?.collect(),
    };
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {peer}"),
        ));
    }
    Ok(addrs)
}

/// Reliable connected queue pair.
pub struct QueuePair {
    qp_number: u32,
    gid: Gid,
    peer: SocketAddr,
    state: QpState,
    table: Arc<RegionTable>,
    stream: TcpStream,
    writer: Option<Arc<Mutex<TcpStream>>>,
    pending: PendingMap,
    completions: Option<Receiver<WorkCompletion>>,
    responder: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

impl QueuePair {
    /// Connect to `peer` (`host` or `host:port`; `default_port` fills in a
    /// missing port).
    ///
    /// # Errors
    /// Returns an error if the name does not resolve or no address accepts
    /// the connection.
    pub fn connect(peer: &str, default_port: u16, pd: &ProtectionDomain) -> io::Result<Self> {
        let mut last_err = None;
        for addr in resolve(peer, default_port)? {
            match TcpStream::connect(addr) {
                Ok(stream) => return Self::from_stream(stream, pd),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
    }

    /// Accept exactly one peer on an already bound listener.
    pub fn accept(listener: &TcpListener, pd: &ProtectionDomain) -> io::Result<Self> {
        tracing::info!(local = %listener.local_addr()?, "waiting for peer");
        let (stream, _) = listener.accept()?;
        Self::from_stream(stream, pd)
    }

    /// Bind `port` on all interfaces and accept exactly one peer.
    pub fn listen(port: u16, pd: &ProtectionDomain) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Self::accept(&listener, pd)
    }

    fn from_stream(stream: TcpStream, pd: &ProtectionDomain) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let gid = Gid::from(stream.local_addr()?.ip());
        let qp_number = alloc_qp_number();
        tracing::info!(qp_number, %peer, "queue pair connected");
        Ok(Self {
            qp_number,
            gid,
            peer,
            state: QpState::Init,
            table: Arc::clone(pd.table()),
            stream,
            writer: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            completions: None,
            responder: None,
            sender: None,
        })
    }

    /// Local QP number.
    pub fn qp_number(&self) -> u32 {
        self.qp_number
    }

    /// Local GID.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current state.
    pub fn state(&self) -> QpState {
        self.state
    }

    /// Posted requests whose completion has not been delivered yet.
    pub fn outstanding(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Exchange endpoint records with the peer and move to RTS.
    ///
    /// Both sides send their record first and then read the peer's, so the
    /// exchange is symmetric and cannot deadlock.
    ///
    /// # Errors
    /// Fails if the QP is not in `Init`, the peer closes early, or the peer's
    /// record is malformed. The QP is left in `Error` on failure.
    pub fn exchange_info(&mut self, local: &QpInfo) -> io::Result<QpInfo> {
        if self.state != QpState::Init {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("exchange_info in state {:?}", self.state),
            ));
        }
        match self.exchange_records(local) {
            Ok(remote) => {
                self.start_responder()?;
                self.state = QpState::Rts;
                tracing::info!(
                    qp_number = self.qp_number,
                    remote_qp_number = remote.qp_number,
                    remote_gid = %remote.gid,
                    "queue pair ready"
                );
                Ok(remote)
            }
            Err(e) => {
                self.state = QpState::Error;
                Err(e)
            }
        }
    }

    fn exchange_records(&mut self, local: &QpInfo) -> io::Result<QpInfo> {
        self.stream.write_all(&local.to_bytes())?;
        self.stream.flush()?;
        let mut buf = [0u8; QP_INFO_SIZE];
        self.stream.read_exact(&mut buf)?;
        QpInfo::from_bytes(&buf)
    }

    fn start_responder(&mut self) -> io::Result<()> {
        let reader = BufReader::new(self.stream.try_clone()?);
        let writer = Arc::new(Mutex::new(self.stream.try_clone()?));
        let (tx, rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();

        let sender_writer = Arc::clone(&writer);
        let qp_number = self.qp_number;
        let sender = thread::Builder::new()
            .name(format!("softrdma-qp{}-tx", self.qp_number))
            .spawn(move || run_sender(qp_number, &sender_writer, out_rx))?;

        let responder = Responder {
            qp_number: self.qp_number,
            reader,
            responses: out_tx,
            table: Arc::clone(&self.table),
            pending: Arc::clone(&self.pending),
            completions: tx,
        };
        let handle = thread::Builder::new()
            .name(format!("softrdma-qp{}", self.qp_number))
            .spawn(move || responder.run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                // The sender exits once its queue is dropped with the responder.
                let _ = sender.join();
                return Err(e);
            }
        };

        self.writer = Some(writer);
        self.completions = Some(rx);
        self.responder = Some(handle);
        self.sender = Some(sender);
        Ok(())
    }

    /// Post a one-sided work request.
    ///
    /// The local SGE is validated against the protection domain: READ targets
    /// need `LOCAL_WRITE`. WRITE data is captured at post time, so the local
    /// buffer may be reused as soon as this returns.
    ///
    /// # Errors
    /// `NotConnected` outside RTS, `InvalidInput` for a zero or oversized
    /// length, a bad local SGE or a duplicate outstanding `wr_id`. A send
    /// failure moves the QP to `Error`.
    pub fn post(&mut self, wr: &WorkRequest) -> io::Result<()> {
        if self.state != QpState::Rts {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("post in state {:?}", self.state),
            ));
        }
        if wr.len == 0 || wr.len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid transfer length {}", wr.len),
            ));
        }
        let Some(writer) = self.writer.clone() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        // A finished responder has already flushed; nothing would ever
        // complete a request posted now.
        if self.responder.as_ref().is_some_and(JoinHandle::is_finished) {
            self.state = QpState::Error;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection to peer lost"));
        }

        let len = wr.len as usize;
        let local_addr = wr.local_addr as u64;
        let (header, payload) = match wr.opcode {
            Opcode::RdmaRead => {
                self.table
                    .with_local(wr.lkey, local_addr, len, AccessFlags::LOCAL_WRITE, |_| ())
                    .map_err(sge_error)?;
                (FrameHeader::read_request(wr.wr_id, wr.remote_addr, wr.rkey, wr.len), Vec::new())
            }
            Opcode::RdmaWrite => {
                let payload = self
                    .table
                    .with_local(wr.lkey, local_addr, len, AccessFlags::empty(), |ptr| {
                        let mut data = vec![0u8; len];
                        // SAFETY: the range was checked against a live registration.
                        unsafe { std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), len) };
                        data
                    })
                    .map_err(sge_error)?;
                (FrameHeader::write_request(wr.wr_id, wr.remote_addr, wr.rkey, wr.len), payload)
            }
        };

        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&wr.wr_id) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("wr_id {} already outstanding", wr.wr_id),
                ));
            }
            pending.insert(
                wr.wr_id,
                Pending {
                    opcode: wr.opcode,
                    local_addr,
                    lkey: wr.lkey,
                    len: wr.len,
                },
            );
        }

        tracing::debug!(
            qp_number = self.qp_number,
            wr_id = wr.wr_id,
            opcode = ?wr.opcode,
            remote_addr = wr.remote_addr,
            rkey = wr.rkey,
            len = wr.len,
            "post"
        );
        let sent = wire::write_frame(&mut *lock(&writer), &header, &payload);
        if let Err(e) = sent {
            lock(&self.pending).remove(&wr.wr_id);
            self.state = QpState::Error;
            return Err(e);
        }
        Ok(())
    }

    /// Block until the next completion.
    ///
    /// There is no timeout: a stalled peer stalls the caller. A lost peer
    /// flushes outstanding requests with [`WcStatus::WrFlushError`]; once the
    /// responder has exited and all completions are consumed this returns
    /// `BrokenPipe`.
    pub fn wait_completion(&mut self) -> io::Result<WorkCompletion> {
        let Some(rx) = self.completions.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("wait_completion in state {:?}", self.state),
            ));
        };
        match rx.recv() {
            Ok(wc) => Ok(wc),
            Err(_) => {
                // Requests posted after the responder's final flush.
                lock(&self.pending).clear();
                self.state = QpState::Error;
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection to peer lost"))
            }
        }
    }

    /// Shut the connection down and join the responder.
    ///
    /// Idempotent. Outstanding requests are flushed.
    pub fn destroy(&mut self) {
        // All handles share one socket; shutting it down unblocks the responder.
        let _ = self.stream.shutdown(Shutdown::Both);
        self.writer = None;
        if let Some(handle) = self.responder.take() {
            if handle.join().is_err() {
                tracing::warn!(qp_number = self.qp_number, "responder thread panicked");
            }
            tracing::info!(qp_number = self.qp_number, "queue pair destroyed");
        }
        if let Some(handle) = self.sender.take() {
            if handle.join().is_err() {
                tracing::warn!(qp_number = self.qp_number, "sender thread panicked");
            }
        }
        self.state = QpState::Error;
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn sge_error(status: WcStatus) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid local SGE: {status}"))
}

/// Write queued response frames until the responder drops its end of the
/// queue. A failed write shuts the socket down, which stops the responder.
fn run_sender(qp_number: u32, writer: &Mutex<TcpStream>, queue: Receiver<Outgoing>) {
    while let Ok((header, payload)) = queue.recv() {
        let mut stream = lock(writer);
        if let Err(e) = wire::write_frame(&mut *stream, &header, &payload) {
            tracing::debug!(qp_number, error = %e, "sender stopped");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}

// =============================================================================
// Responder
// =============================================================================

struct Responder {
    qp_number: u32,
    reader: BufReader<TcpStream>,
    responses: Sender<Outgoing>,
    table: Arc<RegionTable>,
    pending: PendingMap,
    completions: Sender<WorkCompletion>,
}

impl Responder {
    fn run(mut self) {
        loop {
            let header = match wire::read_header(&mut self.reader) {
                Ok(header) => header,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::debug!(qp_number = self.qp_number, "peer closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::debug!(qp_number = self.qp_number, error = %e, "responder stopped");
                    break;
                }
            };
            if let Err(e) = self.handle(&header) {
                tracing::warn!(qp_number = self.qp_number, error = %e, "responder stopped");
                break;
            }
        }
        self.flush();
    }

    fn handle(&mut self, header: &FrameHeader) -> io::Result<()> {
        let len = header.len() as usize;
        match header.kind()? {
            FrameKind::ReadRequest => {
                let result = self.table.with_remote(
                    header.rkey(),
                    header.remote_addr(),
                    len,
                    AccessFlags::REMOTE_READ,
                    |ptr| {
                        let mut data = vec![0u8; len];
                        // SAFETY: the range was checked against a live registration.
                        unsafe { std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), len) };
                        data
                    },
                );
                match result {
                    Ok(data) => self.send(
                        FrameHeader::read_response(header.wr_id(), WcStatus::Success, header.len()),
                        data,
                    ),
                    Err(status) => {
                        self.reject(header, status);
                        self.send(FrameHeader::read_response(header.wr_id(), status, 0), Vec::new())
                    }
                }
            }
            FrameKind::WriteRequest => {
                let payload = wire::read_payload(&mut self.reader, header)?;
                let result = self.table.with_remote(
                    header.rkey(),
                    header.remote_addr(),
                    len,
                    AccessFlags::REMOTE_WRITE,
                    |ptr| {
                        // SAFETY: the range was checked against a live registration.
                        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, len) }
                    },
                );
                let status = match result {
                    Ok(()) => WcStatus::Success,
                    Err(status) => {
                        self.reject(header, status);
                        status
                    }
                };
                self.send(FrameHeader::write_response(header.wr_id(), status, header.len()), Vec::new())
            }
            FrameKind::ReadResponse => {
                let payload = wire::read_payload(&mut self.reader, header)?;
                let pending = self.take_pending(header.wr_id())?;
                let mut status = header.status();
                if status.is_success() {
                    status = if payload.len() != pending.len as usize {
                        WcStatus::RemoteOperationError
                    } else {
                        self.table
                            .with_local(
                                pending.lkey,
                                pending.local_addr,
                                payload.len(),
                                AccessFlags::LOCAL_WRITE,
                                |ptr| {
                                    // SAFETY: the range was checked against a live registration.
                                    unsafe {
                                        std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len())
                                    }
                                },
                            )
                            .map_or_else(|status| status, |()| WcStatus::Success)
                    };
                }
                self.complete(header.wr_id(), pending, status);
                Ok(())
            }
            FrameKind::WriteResponse => {
                let pending = self.take_pending(header.wr_id())?;
                self.complete(header.wr_id(), pending, header.status());
                Ok(())
            }
        }
    }

    fn reject(&self, header: &FrameHeader, status: WcStatus) {
        tracing::warn!(
            qp_number = self.qp_number,
            wr_id = header.wr_id(),
            remote_addr = header.remote_addr(),
            rkey = header.rkey(),
            len = header.len(),
            %status,
            "rejected remote request"
        );
    }

    fn send(&self, header: FrameHeader, payload: Vec<u8>) -> io::Result<()> {
        self.responses
            .send((header, payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response sender stopped"))
    }

    fn take_pending(&self, wr_id: u64) -> io::Result<Pending> {
        lock(&self.pending).remove(&wr_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response for unknown wr_id {wr_id}"),
            )
        })
    }

    fn complete(&self, wr_id: u64, pending: Pending, status: WcStatus) {
        let wc = WorkCompletion {
            wr_id,
            opcode: pending.opcode,
            status,
            byte_len: if status.is_success() { pending.len } else { 0 },
        };
        // The receiver is gone only when the QP itself is being dropped.
        let _ = self.completions.send(wc);
    }

    fn flush(&self) {
        let mut pending = lock(&self.pending);
        let mut flushed: Vec<_> = pending.drain().collect();
        flushed.sort_unstable_by_key(|(wr_id, _)| *wr_id);
        for (wr_id, p) in flushed {
            let _ = self.completions.send(WorkCompletion::flushed(wr_id, p.opcode));
        }
    }
}
