//! Protection Domain and Memory Region management.
//!
//! A Protection Domain (PD) defines a protection scope for RDMA resources.
//! Memory must be registered within a PD before a queue pair created on the
//! same PD can use it, either locally (via `lkey`) or on behalf of the peer
//! (via `rkey`).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bitflags::bitflags;

use crate::cq::WcStatus;

bitflags! {
    /// Memory access flags for Memory Region registration.
    ///
    /// Local read access is always enabled for the MR.
    ///
    /// # Important
    /// If `REMOTE_WRITE` or `REMOTE_ATOMIC` is set, then `LOCAL_WRITE` must also be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = 1;

        /// Enable remote write access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_WRITE = 1 << 1;

        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;

        /// Enable remote atomic operation access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Multiplier used to scatter rkeys. Odd, so the mapping is a bijection on u32.
const RKEY_SCATTER: u32 = 0x9E37_79B1;

#[inline]
fn rkey_for(lkey: u32) -> u32 {
    lkey.wrapping_mul(RKEY_SCATTER)
}

#[derive(Debug, Clone, Copy)]
struct RegionEntry {
    addr: usize,
    len: usize,
    lkey: u32,
    access: AccessFlags,
}

impl RegionEntry {
    /// Pointer to `[addr, addr + len)` if the range lies inside this region.
    fn slice_ptr(&self, addr: u64, len: usize) -> Option<*mut u8> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        if start < self.addr || end > self.addr + self.len {
            return None;
        }
        Some(start as *mut u8)
    }
}

/// Registered regions of one PD, keyed by rkey.
///
/// Memory accesses on behalf of the queue pair run under the read lock, so a
/// region cannot be deregistered while data is being copied in or out of it.
#[derive(Debug)]
pub(crate) struct RegionTable {
    regions: RwLock<HashMap<u32, RegionEntry>>,
    next_lkey: AtomicU32,
}

impl RegionTable {
    fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            next_lkey: AtomicU32::new(1),
        }
    }

    fn insert(&self, addr: usize, len: usize, access: AccessFlags) -> io::Result<(u32, u32)> {
        let lkey = self.next_lkey.fetch_add(1, Ordering::Relaxed);
        if lkey == 0 {
            return Err(io::Error::other("memory key space exhausted"));
        }
        let rkey = rkey_for(lkey);
        let entry = RegionEntry {
            addr,
            len,
            lkey,
            access,
        };
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rkey, entry);
        Ok((lkey, rkey))
    }

    fn remove(&self, rkey: u32) {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&rkey);
    }

    /// Run `f` on a remotely addressed range, checking rkey, bounds and rights.
    pub(crate) fn with_remote<R>(
        &self,
        rkey: u32,
        addr: u64,
        len: usize,
        required: AccessFlags,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Result<R, WcStatus> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let entry = regions.get(&rkey).ok_or(WcStatus::RemoteAccessError)?;
        if !entry.access.contains(required) {
            return Err(WcStatus::RemoteAccessError);
        }
        let ptr = entry
            .slice_ptr(addr, len)
            .ok_or(WcStatus::RemoteAccessError)?;
        Ok(f(ptr))
    }

    /// Run `f` on a locally addressed range identified by its lkey.
    pub(crate) fn with_local<R>(
        &self,
        lkey: u32,
        addr: u64,
        len: usize,
        required: AccessFlags,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Result<R, WcStatus> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let entry = regions
            .get(&rkey_for(lkey))
            .filter(|e| e.lkey == lkey)
            .ok_or(WcStatus::LocalProtectionError)?;
        if !entry.access.contains(required) {
            return Err(WcStatus::LocalProtectionError);
        }
        let ptr = entry
            .slice_ptr(addr, len)
            .ok_or(WcStatus::LocalLengthError)?;
        Ok(f(ptr))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Protection Domain for RDMA resources.
///
/// Queue pairs created on this PD serve remote requests only against regions
/// registered here. Cloning yields another handle to the same domain.
#[derive(Debug, Clone)]
pub struct ProtectionDomain {
    table: Arc<RegionTable>,
}

impl Default for ProtectionDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtectionDomain {
    /// Allocate an empty Protection Domain.
    pub fn new() -> Self {
        Self {
            table: Arc::new(RegionTable::new()),
        }
    }

    pub(crate) fn table(&self) -> &Arc<RegionTable> {
        &self.table
    }

    /// Register a memory region.
    ///
    /// Registers a memory buffer starting at `addr` with size `len` bytes.
    /// The `access` flags describe the desired memory protection attributes.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - The memory pointed to by `addr` with `len` bytes is valid
    /// - The memory remains valid, and is not moved, for the lifetime of the
    ///   returned `MemoryRegion`
    /// - Concurrent remote access to the memory is acceptable to the caller
    ///
    /// # Errors
    /// Returns `InvalidInput` if `addr` is null, `len` is zero, the range wraps
    /// the address space, or `REMOTE_WRITE`/`REMOTE_ATOMIC` is requested
    /// without `LOCAL_WRITE`.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        if addr.is_null() || len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memory region must be non-null and non-empty",
            ));
        }
        if (addr as usize).checked_add(len).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memory region wraps the address space",
            ));
        }
        if access.intersects(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC)
            && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "remote write access requires LOCAL_WRITE",
            ));
        }

        let (lkey, rkey) = self.table.insert(addr as usize, len, access)?;
        tracing::debug!(addr = ?addr, len, lkey, rkey, "registered memory region");
        Ok(MemoryRegion {
            table: Arc::clone(&self.table),
            addr,
            len,
            lkey,
            rkey,
            access,
        })
    }
}

/// Memory Region registered in a Protection Domain.
///
/// The MR provides:
/// - `lkey`: Local key used when posting work requests on this side
/// - `rkey`: Remote key used by the peer to READ/WRITE this memory
///
/// The MR is deregistered when dropped; requests carrying its rkey are
/// rejected from then on.
#[derive(Debug)]
pub struct MemoryRegion {
    table: Arc<RegionTable>,
    addr: *mut u8,
    len: usize,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
}

// The region record is a capability descriptor; the memory it names is
// accessed only through the PD table under its lock.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.table.remove(self.rkey);
    }
}

impl MemoryRegion {
    /// Returns the local key (L_Key) for this memory region.
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Returns the remote key (R_Key) for this memory region.
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    /// Returns the starting address of the registered memory region.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Returns the length of the registered memory region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty regions cannot be registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access rights granted at registration.
    pub fn access(&self) -> AccessFlags {
        self.access
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_access() -> AccessFlags {
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
    }

    #[test]
    fn keys_are_unique_and_non_zero() {
        let pd = ProtectionDomain::new();
        let mut bufs = vec![[0u8; 16]; 32];
        let mrs: Vec<_> = bufs
            .iter_mut()
            .map(|b| unsafe { pd.register(b.as_mut_ptr(), b.len(), full_access()) }.unwrap())
            .collect();

        let mut rkeys: Vec<u32> = mrs.iter().map(|mr| mr.rkey()).collect();
        assert!(rkeys.iter().all(|&k| k != 0));
        assert!(mrs.iter().all(|mr| mr.lkey() != mr.rkey()));
        rkeys.sort_unstable();
        rkeys.dedup();
        assert_eq!(rkeys.len(), 32);
    }

    #[test]
    fn register_rejects_null_and_empty() {
        let pd = ProtectionDomain::new();
        let mut buf = [0u8; 8];
        let err = unsafe { pd.register(std::ptr::null_mut(), 8, full_access()) }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = unsafe { pd.register(buf.as_mut_ptr(), 0, full_access()) }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn remote_write_requires_local_write() {
        let pd = ProtectionDomain::new();
        let mut buf = [0u8; 8];
        let err =
            unsafe { pd.register(buf.as_mut_ptr(), buf.len(), AccessFlags::REMOTE_WRITE) }
                .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn drop_deregisters() {
        let pd = ProtectionDomain::new();
        let mut buf = [0u8; 8];
        let mr = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), full_access()) }.unwrap();
        let (rkey, addr) = (mr.rkey(), mr.addr() as u64);
        assert_eq!(pd.table().len(), 1);
        drop(mr);
        assert_eq!(pd.table().len(), 0);
        let res = pd
            .table()
            .with_remote(rkey, addr, 8, AccessFlags::REMOTE_READ, |_| ());
        assert_eq!(res, Err(WcStatus::RemoteAccessError));
    }

    #[test]
    fn remote_checks_bounds_and_rights() {
        let pd = ProtectionDomain::new();
        let mut buf = [0u8; 64];
        let mr = unsafe {
            pd.register(
                buf.as_mut_ptr(),
                buf.len(),
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
            )
        }
        .unwrap();
        let base = mr.addr() as u64;
        let table = pd.table();

        assert!(table.with_remote(mr.rkey(), base, 64, AccessFlags::REMOTE_READ, |_| ()).is_ok());
        assert!(table.with_remote(mr.rkey(), base + 60, 4, AccessFlags::REMOTE_READ, |_| ()).is_ok());
        assert_eq!(
            table.with_remote(mr.rkey(), base + 61, 4, AccessFlags::REMOTE_READ, |_| ()),
            Err(WcStatus::RemoteAccessError)
        );
        assert_eq!(
            table.with_remote(mr.rkey(), base - 1, 4, AccessFlags::REMOTE_READ, |_| ()),
            Err(WcStatus::RemoteAccessError)
        );
        assert_eq!(
            table.with_remote(mr.rkey(), base, 4, AccessFlags::REMOTE_WRITE, |_| ()),
            Err(WcStatus::RemoteAccessError)
        );
        assert_eq!(
            table.with_remote(mr.rkey(), u64::MAX, 4, AccessFlags::REMOTE_READ, |_| ()),
            Err(WcStatus::RemoteAccessError)
        );
    }

    #[test]
    fn local_lookup_uses_lkey_not_rkey() {
        let pd = ProtectionDomain::new();
        let mut buf = [0u8; 16];
        let mr = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), full_access()) }.unwrap();
        let base = mr.addr() as u64;
        let table = pd.table();

        assert!(table.with_local(mr.lkey(), base, 16, AccessFlags::LOCAL_WRITE, |_| ()).is_ok());
        assert_eq!(
            table.with_local(mr.rkey(), base, 16, AccessFlags::LOCAL_WRITE, |_| ()),
            Err(WcStatus::LocalProtectionError)
        );
        assert_eq!(
            table.with_local(mr.lkey(), base, 17, AccessFlags::empty(), |_| ()),
            Err(WcStatus::LocalLengthError)
        );
    }
}
