//! Helpers for reading and writing scatter/gather I/O through the memory
//! view.

use nix::errno::Errno;
use sim_support::syscall_types::ForeignPtr;

use crate::host::memory_manager::MemoryManager;

/// A scatter/gather element: a foreign buffer and its length.
#[derive(Copy, Clone, Debug)]
pub struct IoVec {
    pub base: ForeignPtr<u8>,
    pub len: usize,
}

/// Read an array of `iovec` structs from the process's memory.
pub fn read_iovecs(
    mem: &MemoryManager,
    iov_ptr: ForeignPtr<libc::iovec>,
    count: usize,
) -> Result<Vec<IoVec>, Errno> {
    if count > libc::UIO_MAXIOV as usize {
        return Err(Errno::EINVAL);
    }

    let mut raw = vec![
        libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        };
        count
    ];
    mem.read_vals(iov_ptr, &mut raw)?;

    Ok(raw
        .into_iter()
        .map(|x| IoVec {
            base: ForeignPtr::from_raw(x.iov_base as usize),
            len: x.iov_len,
        })
        .collect())
}

/// A reader over the bytes of a foreign iovec list.
pub struct IoVecReader<'a> {
    iovs: std::vec::IntoIter<IoVec>,
    current: Option<IoVec>,
    mem: &'a MemoryManager,
}

impl<'a> IoVecReader<'a> {
    pub fn new(iovs: &[IoVec], mem: &'a MemoryManager) -> Self {
        Self {
            iovs: iovs.to_vec().into_iter(),
            current: None,
            mem,
        }
    }
}

impl std::io::Read for IoVecReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some(iov) = self.current.take().or_else(|| self.iovs.next()) else {
                return Ok(0);
            };

            if iov.len == 0 {
                continue;
            }

            let num = std::cmp::min(iov.len, buf.len());
            if num == 0 {
                // the caller's buffer is full
                self.current = Some(iov);
                return Ok(0);
            }

            self.mem
                .read_bytes(iov.base, &mut buf[..num])
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            if num < iov.len {
                self.current = Some(IoVec {
                    base: iov.base.add(num),
                    len: iov.len - num,
                });
            }

            return Ok(num);
        }
    }
}

/// A writer over the bytes of a foreign iovec list.
pub struct IoVecWriter<'a> {
    iovs: std::vec::IntoIter<IoVec>,
    current: Option<IoVec>,
    mem: &'a MemoryManager,
}

impl<'a> IoVecWriter<'a> {
    pub fn new(iovs: &[IoVec], mem: &'a MemoryManager) -> Self {
        Self {
            iovs: iovs.to_vec().into_iter(),
            current: None,
            mem,
        }
    }
}

impl std::io::Write for IoVecWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            let Some(iov) = self.current.take().or_else(|| self.iovs.next()) else {
                // no space left in the iovec list
                return Ok(0);
            };

            if iov.len == 0 {
                continue;
            }

            let num = std::cmp::min(iov.len, buf.len());
            if num == 0 {
                self.current = Some(iov);
                return Ok(0);
            }

            // The MemoryManager's write methods take &mut self, but the
            // writer only holds a shared reference; route through an
            // explicit mutable borrow of the range instead.
            let mut borrow = self
                .mem
                .memory_ref_mut(iov.base, num)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            borrow.as_mut_slice().copy_from_slice(&buf[..num]);
            borrow
                .flush()
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            if num < iov.len {
                self.current = Some(IoVec {
                    base: iov.base.add(num),
                    len: iov.len - num,
                });
            }

            return Ok(num);
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory_manager::AddressSpace;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    fn setup() -> (MemoryManager, ForeignPtr<u8>) {
        let space = Arc::new(Mutex::new(AddressSpace::new(4096)));
        let ptr = space.lock().unwrap().alloc(64);
        (MemoryManager::new(space), ptr)
    }

    #[test]
    fn test_reader_spans_iovs() {
        let (mut mem, ptr) = setup();
        mem.write_bytes(ptr, b"helloworld").unwrap();

        let iovs = [
            IoVec { base: ptr, len: 5 },
            IoVec {
                base: ptr.add(5),
                len: 5,
            },
        ];

        let mut reader = IoVecReader::new(&iovs, &mem);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(&out, b"helloworld");
    }

    #[test]
    fn test_writer_spans_iovs() {
        let (mem, ptr) = setup();

        let iovs = [
            IoVec { base: ptr, len: 3 },
            IoVec {
                base: ptr.add(3),
                len: 7,
            },
        ];

        let mut writer = IoVecWriter::new(&iovs, &mem);
        writer.write_all(b"helloworld").unwrap();

        let mut buf = [0u8; 10];
        mem.read_bytes(ptr, &mut buf).unwrap();
        assert_eq!(&buf, b"helloworld");
    }
}
