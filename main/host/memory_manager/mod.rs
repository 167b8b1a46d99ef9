//! The memory view: how syscall handlers read and write a managed process's
//! address space by virtual pointer. Handlers must never dereference foreign
//! pointers directly; everything goes through a [`MemoryManager`], which
//! keeps the transport between the simulator and the process an
//! implementation detail.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use sim_support::syscall_types::ForeignPtr;

/// Marker for types that can be copied to and from a managed process's
/// memory as raw bytes.
///
/// # Safety
///
/// Implementors must be valid for any bit pattern and contain no padding
/// requirements that make byte-copying undefined (plain-old-data).
pub unsafe trait Pod: Copy {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i8 {}
unsafe impl Pod for i16 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for i64 {}
unsafe impl Pod for usize {}
unsafe impl Pod for isize {}
unsafe impl Pod for libc::timespec {}
unsafe impl Pod for libc::timeval {}
unsafe impl Pod for libc::iovec {}
unsafe impl Pod for libc::pollfd {}
unsafe impl Pod for libc::epoll_event {}
unsafe impl Pod for libc::sockaddr_in {}
unsafe impl Pod for libc::stat {}
unsafe impl Pod for libc::statfs {}
unsafe impl Pod for libc::itimerspec {}
unsafe impl Pod for libc::msghdr {}
unsafe impl Pod for libc::statx {}

fn as_bytes<T: Pod>(vals: &[T]) -> &[u8] {
    // SAFETY: T is plain-old-data
    unsafe {
        std::slice::from_raw_parts(vals.as_ptr() as *const u8, std::mem::size_of_val(vals))
    }
}

fn as_bytes_mut<T: Pod>(vals: &mut [T]) -> &mut [u8] {
    // SAFETY: T is plain-old-data, valid for any bit pattern
    unsafe {
        std::slice::from_raw_parts_mut(vals.as_mut_ptr() as *mut u8, std::mem::size_of_val(vals))
    }
}

/// Lowest valid address in an emulated address space, so that null (and the
/// pages around it) always faults.
const BASE_ADDRESS: usize = 0x10000;

/// An emulated address space: a flat allocation shared between the managed
/// process's driver thread and the simulator.
#[derive(Debug)]
pub struct AddressSpace {
    mem: Vec<u8>,
    next_alloc: usize,
}

impl AddressSpace {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            next_alloc: 0,
        }
    }

    /// Bump-allocate `len` bytes, returning the virtual address.
    pub fn alloc(&mut self, len: usize) -> ForeignPtr<u8> {
        // keep allocations 16-byte aligned
        let start = (self.next_alloc + 15) & !15;
        assert!(
            start + len <= self.mem.len(),
            "emulated address space exhausted"
        );
        self.next_alloc = start + len;
        ForeignPtr::from_raw(BASE_ADDRESS + start)
    }

    /// Read `len` bytes at the virtual address. Used by the process-side
    /// driver, which addresses its own memory directly.
    pub fn read(&self, addr: usize, len: usize) -> Result<Vec<u8>, Errno> {
        Ok(self.slice(addr, len)?.to_vec())
    }

    /// Write bytes at the virtual address.
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<(), Errno> {
        self.slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    fn slice(&self, ptr: usize, len: usize) -> Result<&[u8], Errno> {
        let start = ptr.checked_sub(BASE_ADDRESS).ok_or(Errno::EFAULT)?;
        let end = start.checked_add(len).ok_or(Errno::EFAULT)?;
        self.mem.get(start..end).ok_or(Errno::EFAULT)
    }

    fn slice_mut(&mut self, ptr: usize, len: usize) -> Result<&mut [u8], Errno> {
        let start = ptr.checked_sub(BASE_ADDRESS).ok_or(Errno::EFAULT)?;
        let end = start.checked_add(len).ok_or(Errno::EFAULT)?;
        self.mem.get_mut(start..end).ok_or(Errno::EFAULT)
    }
}

/// Provides accessors for reading and writing a managed process's memory.
pub struct MemoryManager {
    space: Arc<Mutex<AddressSpace>>,
    /// Outstanding mutable borrows as (start, len) ranges; overlapping
    /// mutable borrows within one syscall are a bug in the handler and are
    /// rejected.
    active_borrows: RefCell<Vec<(usize, usize)>>,
}

impl MemoryManager {
    pub fn new(space: Arc<Mutex<AddressSpace>>) -> Self {
        Self {
            space,
            active_borrows: RefCell::new(Vec::new()),
        }
    }

    /// Read `dst.len()` bytes starting at `ptr`.
    pub fn read_bytes(&self, ptr: ForeignPtr<u8>, dst: &mut [u8]) -> Result<(), Errno> {
        let space = self.space.lock().unwrap();
        dst.copy_from_slice(space.slice(usize::from(ptr), dst.len())?);
        Ok(())
    }

    /// Write `src` starting at `ptr`. The write is visible to the managed
    /// process as soon as the owning syscall returns.
    pub fn write_bytes(&mut self, ptr: ForeignPtr<u8>, src: &[u8]) -> Result<(), Errno> {
        let mut space = self.space.lock().unwrap();
        space
            .slice_mut(usize::from(ptr), src.len())?
            .copy_from_slice(src);
        Ok(())
    }

    /// Read `vals.len()` values of `T` starting at `ptr`.
    pub fn read_vals<T: Pod>(&self, ptr: ForeignPtr<T>, vals: &mut [T]) -> Result<(), Errno> {
        self.read_bytes(ptr.cast::<u8>(), as_bytes_mut(vals))
    }

    /// Read a single value of `T` at `ptr`.
    pub fn read_val<T: Pod>(&self, ptr: ForeignPtr<T>) -> Result<T, Errno> {
        // SAFETY: T: Pod guarantees T is valid for any bit pattern, including
        // all-zeros. The zeroed value is fully overwritten by `read_vals`.
        let mut val = [unsafe { std::mem::zeroed::<T>() }];
        self.read_vals(ptr, &mut val)?;
        Ok(val[0])
    }

    /// Write the values to the process's memory starting at `ptr`.
    pub fn write_vals<T: Pod>(&mut self, ptr: ForeignPtr<T>, vals: &[T]) -> Result<(), Errno> {
        self.write_bytes(ptr.cast::<u8>(), as_bytes(vals))
    }

    /// Read a NUL-terminated string of at most `max_len` bytes (including the
    /// NUL).
    pub fn read_cstring(&self, ptr: ForeignPtr<u8>, max_len: usize) -> Result<String, Errno> {
        let space = self.space.lock().unwrap();

        // the string may sit at the end of the space; probe what's available
        for probe_len in 1..=max_len {
            let Ok(bytes) = space.slice(usize::from(ptr), probe_len) else {
                break;
            };
            if let Some(nul) = bytes.iter().position(|x| *x == 0) {
                return String::from_utf8(bytes[..nul].to_vec()).map_err(|_| Errno::EINVAL);
            }
            if probe_len == max_len {
                return Err(Errno::ENAMETOOLONG);
            }
        }

        Err(Errno::EFAULT)
    }

    /// Mutably borrow a range of the process's memory. Overlapping mutable
    /// borrows are rejected with `EFAULT`; the borrowed bytes are written
    /// back when the guard's [`flush`](MemoryRefMut::flush) runs (or the
    /// guard drops).
    pub fn memory_ref_mut(
        &self,
        ptr: ForeignPtr<u8>,
        len: usize,
    ) -> Result<MemoryRefMut<'_>, Errno> {
        let start = usize::from(ptr);

        {
            let active = self.active_borrows.borrow();
            for (b_start, b_len) in active.iter() {
                let disjoint = start + len <= *b_start || b_start + b_len <= start;
                if !disjoint {
                    return Err(Errno::EFAULT);
                }
            }
        }

        let mut buf = vec![0u8; len];
        {
            let space = self.space.lock().unwrap();
            buf.copy_from_slice(space.slice(start, len)?);
        }

        self.active_borrows.borrow_mut().push((start, len));

        Ok(MemoryRefMut {
            manager: self,
            start,
            buf,
            flushed: false,
        })
    }
}

/// A mutable borrow of a managed process's memory range.
pub struct MemoryRefMut<'a> {
    manager: &'a MemoryManager,
    start: usize,
    buf: Vec<u8>,
    flushed: bool,
}

impl MemoryRefMut<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Write the borrowed bytes back to the process.
    pub fn flush(mut self) -> Result<(), Errno> {
        self.flush_helper()
    }

    fn flush_helper(&mut self) -> Result<(), Errno> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;

        let mut space = self.manager.space.lock().unwrap();
        space
            .slice_mut(self.start, self.buf.len())?
            .copy_from_slice(&self.buf);

        let mut active = self.manager.active_borrows.borrow_mut();
        let pos = active
            .iter()
            .position(|(s, l)| *s == self.start && *l == self.buf.len())
            .unwrap();
        active.remove(pos);

        Ok(())
    }
}

impl Drop for MemoryRefMut<'_> {
    fn drop(&mut self) {
        let _ = self.flush_helper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        MemoryManager::new(Arc::new(Mutex::new(AddressSpace::new(4096))))
    }

    #[test]
    fn test_read_write_roundtrip() {
        let mut mm = manager();
        let ptr = mm.space.lock().unwrap().alloc(16);

        mm.write_bytes(ptr, b"hello").unwrap();

        let mut buf = [0u8; 5];
        mm.read_bytes(ptr, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_typed_copies() {
        let mut mm = manager();
        let ptr = mm.space.lock().unwrap().alloc(24).cast::<u64>();

        mm.write_vals(ptr, &[1u64, 2, 3]).unwrap();

        let mut vals = [0u64; 3];
        mm.read_vals(ptr, &mut vals).unwrap();
        assert_eq!(vals, [1, 2, 3]);
    }

    #[test]
    fn test_faults_outside_space() {
        let mm = manager();

        let mut buf = [0u8; 4];
        // null pointer
        assert_eq!(
            mm.read_bytes(ForeignPtr::null(), &mut buf),
            Err(Errno::EFAULT)
        );
        // out of range
        assert_eq!(
            mm.read_bytes(ForeignPtr::from_raw(BASE_ADDRESS + 8192), &mut buf),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn test_read_cstring() {
        let mut mm = manager();
        let ptr = mm.space.lock().unwrap().alloc(32);

        mm.write_bytes(ptr, b"/etc/hosts\0").unwrap();
        assert_eq!(mm.read_cstring(ptr, 32).unwrap(), "/etc/hosts");

        // an unterminated string is an error
        mm.write_bytes(ptr, b"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx").unwrap();
        assert_eq!(mm.read_cstring(ptr, 8), Err(Errno::ENAMETOOLONG));
    }

    #[test]
    fn test_overlapping_mutable_borrows_rejected() {
        let mm = manager();
        let ptr = mm.space.lock().unwrap().alloc(64);
        let start = usize::from(ptr);

        let borrow = mm.memory_ref_mut(ptr, 16).unwrap();

        // overlapping is rejected
        assert!(mm
            .memory_ref_mut(ForeignPtr::from_raw(start + 8), 16)
            .is_err());

        // disjoint is fine
        let other = mm.memory_ref_mut(ForeignPtr::from_raw(start + 16), 16).unwrap();
        drop(other);

        // returning the borrow makes the range available again
        borrow.flush().unwrap();
        let again = mm.memory_ref_mut(ForeignPtr::from_raw(start + 8), 16).unwrap();
        drop(again);
    }

    #[test]
    fn test_borrow_flushes_writes() {
        let mm = manager();
        let ptr = mm.space.lock().unwrap().alloc(8);

        let mut borrow = mm.memory_ref_mut(ptr, 4).unwrap();
        borrow.as_mut_slice().copy_from_slice(b"abcd");
        borrow.flush().unwrap();

        let mut buf = [0u8; 4];
        mm.read_bytes(ptr, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
