use std::fs::File as OsFile;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use sim_support::syscall_types::ForeignPtr;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileSignals, FileState, FileStatus};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::io::{IoVec, IoVecReader, IoVecWriter};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::utility::callback_queue::CallbackQueue;

/// A file backed by a real file opened by the simulator on behalf of the
/// managed process. I/O is serviced synchronously against the OS file and is
/// instantaneous in virtual time; a regular file is always readable and
/// writable from the blocking machinery's point of view.
pub struct RegularFile {
    os_file: OsFile,
    /// The absolute path the file was opened at. `openat` resolves relative
    /// paths against this when given a directory descriptor.
    abs_path: PathBuf,
    /// Our own cursor; the managed process may share the OS file between
    /// multiple descriptors, but each file description has one offset.
    offset: u64,
    mode: FileMode,
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
    // should only be used by `OpenFile` to make sure there is only ever one
    // `OpenFile` instance for this file
    has_open_file: bool,
}

impl RegularFile {
    pub fn new(os_file: OsFile, abs_path: PathBuf, mode: FileMode, status: FileStatus) -> Arc<AtomicRefCell<Self>> {
        Arc::new(AtomicRefCell::new(Self {
            os_file,
            abs_path,
            offset: 0,
            mode,
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE | FileState::READABLE | FileState::WRITABLE,
            status,
            has_open_file: false,
        }))
    }

    pub fn abs_path(&self) -> &PathBuf {
        &self.abs_path
    }

    pub fn os_fd(&self) -> i32 {
        self.os_file.as_raw_fd()
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    pub fn supports_sa_restart(&self) -> bool {
        true
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        let old_state = self.state;
        self.state.remove(FileState::all());
        self.state.insert(FileState::CLOSED);

        let states_changed = self.state ^ old_state;
        if !states_changed.is_empty() {
            self.event_source.notify_listeners(
                self.state,
                states_changed,
                FileSignals::empty(),
                cb_queue,
            );
        }

        // the backing OS file is closed when `self.os_file` drops
        Ok(())
    }

    pub fn readv(
        &mut self,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
        _flags: libc::c_int,
        mem: &mut MemoryManager,
        _cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        if !self.mode.contains(FileMode::READ) {
            return Err(Errno::EBADF.into());
        }

        let read_offset = match offset {
            Some(x) => u64::try_from(x).map_err(|_| Errno::EINVAL)?,
            None => self.offset,
        };

        let len: usize = iovs.iter().map(|x| x.len).sum();
        let mut buf = vec![0u8; len];

        let num_read = nix::sys::uio::pread(&self.os_file, &mut buf, read_offset as libc::off_t)
            .map_err(SyscallError::from)?;

        let mut writer = IoVecWriter::new(iovs, mem);
        std::io::Write::write_all(&mut writer, &buf[..num_read])?;

        // an explicit offset (pread) does not move the cursor
        if offset.is_none() {
            self.offset += num_read as u64;
        }

        Ok(num_read.try_into().unwrap())
    }

    pub fn writev(
        &mut self,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
        _flags: libc::c_int,
        mem: &mut MemoryManager,
        _cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        if !self.mode.contains(FileMode::WRITE) {
            return Err(Errno::EBADF.into());
        }

        if self.status.contains(FileStatus::APPEND) {
            let stat = nix::sys::stat::fstat(self.os_fd()).map_err(SyscallError::from)?;
            self.offset = stat.st_size as u64;
        }

        let write_offset = match offset {
            Some(x) => u64::try_from(x).map_err(|_| Errno::EINVAL)?,
            None => self.offset,
        };

        let len: usize = iovs.iter().map(|x| x.len).sum();
        let mut buf = vec![0u8; len];
        let mut reader = IoVecReader::new(iovs, mem);
        std::io::Read::read_exact(&mut reader, &mut buf)?;

        let num_written = nix::sys::uio::pwrite(&self.os_file, &buf, write_offset as libc::off_t)
            .map_err(SyscallError::from)?;

        if offset.is_none() {
            self.offset += num_written as u64;
        }

        Ok(num_written.try_into().unwrap())
    }

    pub fn lseek(&mut self, offset: libc::off_t, whence: libc::c_int) -> Result<u64, SyscallError> {
        let size = || -> Result<u64, SyscallError> {
            let stat = nix::sys::stat::fstat(self.os_fd()).map_err(SyscallError::from)?;
            Ok(stat.st_size as u64)
        };

        let base: i64 = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => self.offset.try_into().unwrap(),
            libc::SEEK_END => size()?.try_into().unwrap(),
            _ => return Err(Errno::EINVAL.into()),
        };

        let new_offset = base.checked_add(offset).ok_or(Errno::EOVERFLOW)?;
        let new_offset: u64 = new_offset.try_into().map_err(|_| Errno::EINVAL)?;

        self.offset = new_offset;
        Ok(new_offset)
    }

    pub fn stat(&self) -> Result<libc::stat, SyscallError> {
        let stat = nix::sys::stat::fstat(self.os_fd()).map_err(SyscallError::from)?;
        Ok(stat)
    }

    pub fn ioctl(
        &mut self,
        request: u64,
        _arg_ptr: ForeignPtr<()>,
        _mem: &mut MemoryManager,
    ) -> SyscallResult {
        match request {
            r if r == libc::TCGETS as u64 || r == libc::TIOCGWINSZ as u64 => {
                // not a terminal
                Err(Errno::ENOTTY.into())
            }
            request => {
                log::warn!("We do not yet handle ioctl request {request} on regular files");
                Err(Errno::EINVAL.into())
            }
        }
    }

    pub fn add_listener(
        &mut self,
        monitoring_state: FileState,
        monitoring_signals: FileSignals,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue)
            + Send
            + Sync
            + 'static,
    ) -> StateListenHandle {
        self.event_source
            .add_listener(monitoring_state, monitoring_signals, filter, notify_fn)
    }
}
