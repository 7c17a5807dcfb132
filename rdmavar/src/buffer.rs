//! Page-aligned buffers handed to memory registration.

use std::io;

/// Page size for aligned allocations.
pub const PAGE_SIZE: usize = 4096;

/// Zeroed, page-aligned heap buffer. The address never changes, so the
/// buffer can back a memory region for as long as it lives.
pub(crate) struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
}

// The buffer is plain owned memory; all access goes through `&self`/`&mut self`
// or through a memory region that is deregistered before the buffer is freed.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-sized buffer"));
        }
        let aligned_size = size
            .checked_add(PAGE_SIZE - 1)
            .map(|s| s & !(PAGE_SIZE - 1))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer size overflow"))?;

        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut ptr, PAGE_SIZE, aligned_size) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, aligned_size) };
        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` in at `offset`. The caller has checked the range.
    pub fn fill_at(&mut self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.size());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len()) };
    }

    /// Copy `out.len()` bytes out from `offset`. The caller has checked the range.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.size());
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), out.len()) };
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr as *mut libc::c_void);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_pages_and_zeroes() {
        let buf = AlignedBuffer::new(100).unwrap();
        assert_eq!(buf.size(), PAGE_SIZE);
        assert_eq!(buf.addr() % PAGE_SIZE as u64, 0);
        let mut out = [0xffu8; 16];
        buf.read_at(84, &mut out);
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn fill_then_read() {
        let mut buf = AlignedBuffer::new(PAGE_SIZE + 1).unwrap();
        assert_eq!(buf.size(), 2 * PAGE_SIZE);
        buf.fill_at(PAGE_SIZE - 2, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        buf.read_at(PAGE_SIZE - 2, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(AlignedBuffer::new(0).is_err());
    }
}
