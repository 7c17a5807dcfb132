//! Remote scalar proxy.
//!
//! A [`RemoteVar`] binds one fixed-size value in the peer's memory. Every
//! `get` is one READ and every `set` is one WRITE; nothing is cached.
//!
//! Compound updates (`add_assign`, `post_increment`, ...) are read-modify-
//! write: one READ, local arithmetic, one WRITE. They are not atomic. A
//! writer racing between the READ and the WRITE loses its update.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;


use crate::connection::Connection;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::numeric::{Numeric, Pod};
use crate::transport::{SoftRdma, Transport};

/// Proxy for a single `T` at a remote address.
pub struct RemoteVar<'c, T, X: Transport = SoftRdma> {
    conn: &'c Connection<X>,
    addr: u64,
    rkey: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T, X: Transport> Clone for RemoteVar<'_, T, X> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, X: Transport> Copy for RemoteVar<'_, T, X> {}

impl<T, X: Transport> fmt::Debug for RemoteVar<'_, T, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteVar")
            .field("addr", &format_args!("0x{:x}", self.addr))
            .field("rkey", &format_args!("0x{:x}", self.rkey))
            .field("size", &size_of::<T>())
            .finish()
    }
}

impl<'c, T: Pod, X: Transport> RemoteVar<'c, T, X> {
    /// Bind `T` at `addr` under `rkey` on `conn`.
    pub fn new(conn: &'c Connection<X>, addr: u64, rkey: u32) -> Self {
        Self {
            conn,
            addr,
            rkey,
            _marker: PhantomData,
        }
    }

    /// Bind `T` at `offset` bytes into the region named by `credential`.
    pub fn from_credential(conn: &'c Connection<X>, credential: Credential, offset: u64) -> Result<Self> {
        let target = credential
            .offset(offset)
            .ok_or_else(|| Error::invalid(format!("offset {offset} overflows {credential}")))?;
        Ok(Self::new(conn, target.addr, target.rkey))
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    /// Read the current remote value.
    pub fn get(&self) -> Result<T> {
        let mut value = T::new_zeroed();
        self.conn.read_at(value.as_mut_bytes(), self.addr, self.rkey)?;
        Ok(value)
    }

    /// Overwrite the remote value.
    pub fn set(&self, value: T) -> Result<()> {
        self.conn.write_at(value.as_bytes(), self.addr, self.rkey)
    }

    /// Read, apply `f`, write back. Returns the written value.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> Result<T> {
        let value = f(self.get()?);
        self.set(value)?;
        Ok(value)
    }
}

impl<T: Numeric, X: Transport> RemoteVar<'_, T, X> {
    pub fn add_assign(&self, rhs: T) -> Result<()> {
        self.update(|v| v.add(rhs)).map(drop)
    }

    pub fn sub_assign(&self, rhs: T) -> Result<()> {
        self.update(|v| v.sub(rhs)).map(drop)
    }

    pub fn mul_assign(&self, rhs: T) -> Result<()> {
        self.update(|v| v.mul(rhs)).map(drop)
    }

    /// Fails with [`Error::Domain`] on a zero divisor, before any transfer.
    pub fn div_assign(&self, rhs: T) -> Result<()> {
        if rhs.is_zero() {
            return Err(Error::Domain("division by zero"));
        }
        self.update(|v| v.div(rhs)).map(drop)
    }

    /// `++x`: returns the proxy, which now reads as the incremented value.
    pub fn pre_increment(&self) -> Result<&Self> {
        self.add_assign(T::ONE)?;
        Ok(self)
    }

    /// `x++`: returns the value before the increment.
    pub fn post_increment(&self) -> Result<T> {
        let old = self.get()?;
        self.set(old.add(T::ONE))?;
        Ok(old)
    }

    pub fn pre_decrement(&self) -> Result<&Self> {
        self.sub_assign(T::ONE)?;
        Ok(self)
    }

    pub fn post_decrement(&self) -> Result<T> {
        let old = self.get()?;
        self.set(old.sub(T::ONE))?;
        Ok(old)
    }
}
