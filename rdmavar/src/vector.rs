//! Remote array proxy.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use crate::connection::Connection;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::numeric::Pod;
use crate::transport::{SoftRdma, Transport};
use crate::variable::RemoteVar;

/// Proxy for `len` contiguous `T`s starting at a remote address.
///
/// Element `i` lives at `base + i * size_of::<T>()`. Indices are checked
/// before anything is posted.
pub struct RemoteVec<'c, T, X: Transport = SoftRdma> {
    conn: &'c Connection<X>,
    base: u64,
    rkey: u32,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T, X: Transport> fmt::Debug for RemoteVec<'_, T, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteVec")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("rkey", &format_args!("0x{:x}", self.rkey))
            .field("len", &self.len)
            .finish()
    }
}

impl<'c, T: Pod, X: Transport> RemoteVec<'c, T, X> {
    /// Bind `len` elements at `base` under `rkey`.
    ///
    /// # Errors
    /// `InvalidArgument` if `len` is zero or the array would run past the
    /// end of the address space.
    pub fn new(conn: &'c Connection<X>, base: u64, rkey: u32, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid("remote array must have at least one element"));
        }
        let bytes = (len as u64).checked_mul(size_of::<T>() as u64);
        if bytes.and_then(|b| base.checked_add(b)).is_none() {
            return Err(Error::invalid(format!(
                "{len} elements at 0x{base:x} overflow the address space"
            )));
        }
        Ok(Self {
            conn,
            base,
            rkey,
            len,
            _marker: PhantomData,
        })
    }

    /// Bind `len` elements at the start of the region named by `credential`.
    pub fn from_credential(conn: &'c Connection<X>, credential: Credential, len: usize) -> Result<Self> {
        Self::new(conn, credential.addr, credential.rkey, len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; construction rejects empty arrays.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element_size(&self) -> usize {
        size_of::<T>()
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    /// Accessor for element `index`.
    pub fn at(&self, index: usize) -> Result<ElementRef<'_, 'c, T, X>> {
        if index >= self.len {
            return Err(Error::OutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(ElementRef { vec: self, index })
    }

    /// Read element `index`.
    pub fn get(&self, index: usize) -> Result<T> {
        self.at(index)?.get()
    }

    /// Write element `index`.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        self.at(index)?.set(value)
    }

    /// Read every element in order, one READ each.
    pub fn iter(&self) -> impl Iterator<Item = Result<T>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// Read the whole array, one READ per element.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.iter().collect()
    }

    fn element_addr(&self, index: usize) -> u64 {
        // Cannot overflow: checked for the whole array in `new`.
        self.base + index as u64 * size_of::<T>() as u64
    }
}

/// Transient accessor for one array element, consumed by `get` or `set`.
pub struct ElementRef<'a, 'c, T, X: Transport = SoftRdma> {
    vec: &'a RemoteVec<'c, T, X>,
    index: usize,
}

impl<'a, 'c, T: Pod, X: Transport> ElementRef<'a, 'c, T, X> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// `base + index * size_of::<T>()`.
    pub fn addr(&self) -> u64 {
        self.vec.element_addr(self.index)
    }

    pub fn get(self) -> Result<T> {
        self.into_var().get()
    }

    pub fn set(self, value: T) -> Result<()> {
        self.into_var().set(value)
    }

    /// A scalar proxy bound to this element, usable past the accessor.
    pub fn into_var(self) -> RemoteVar<'c, T, X> {
        RemoteVar::new(self.vec.conn, self.addr(), self.vec.rkey)
    }
}
