//! File descriptors and file descriptions (equivalent to Linux `struct
//! file`s).

use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use sim_support::syscall_types::ForeignPtr;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::{Socket, SocketRef, SocketRefMut};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::io::IoVec;
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::{IsSend, IsSync};

pub mod descriptor_table;
pub mod epoll;
pub mod eventfd;
pub mod listener;
pub mod pipe;
pub mod regular_file;
pub mod shared_buf;
pub mod socket;
pub mod timerfd;

bitflags::bitflags! {
    /// Flags that can be changed from the managed process (analogous to the
    /// Linux `filp->f_flags` status flags). File access mode flags (ex:
    /// `O_RDWR`) are stored elsewhere, and file creation flags (ex:
    /// `O_CREAT`) are not stored anywhere.
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FileStatus: i32 {
        const NONBLOCK = libc::O_NONBLOCK;
        const APPEND = libc::O_APPEND;
        const DIRECT = libc::O_DIRECT;
        /// Close-on-exec as requested at open time (ex: `O_CLOEXEC`,
        /// `SOCK_CLOEXEC`). The descriptor-level `FD_CLOEXEC` flag lives in
        /// the descriptor table slot instead.
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

impl FileStatus {
    pub fn as_o_flags(&self) -> i32 {
        self.bits()
    }

    /// Returns a tuple of the `FileStatus` and any remaining unhandled flags.
    pub fn from_o_flags(flags: i32) -> (Self, i32) {
        let status = Self::from_bits_truncate(flags);
        let remaining = flags & !status.bits();
        (status, remaining)
    }
}

bitflags::bitflags! {
    /// Flags that should generally not change (analogous to the Linux
    /// `filp->f_mode`).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FileMode: u32 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
    }
}

bitflags::bitflags! {
    /// Flags representing the state of a file. Listeners can subscribe to
    /// state changes through the file's [`StateEventSource`].
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct FileState: u16 {
        /// The file is open and reachable from a descriptor table.
        const ACTIVE = 1 << 0;
        /// Can be read, i.e. there is data waiting for the user.
        const READABLE = 1 << 1;
        /// Can be written, i.e. there is available buffer space.
        const WRITABLE = 1 << 2;
        /// The user already called close.
        const CLOSED = 1 << 3;
        /// An error is pending on the file (ex: a socket that was reset).
        const ERROR = 1 << 4;
        /// The peer hung up (ex: the write end of a pipe closed).
        const HUP = 1 << 5;
        /// A listening socket has a pending incoming connection.
        const SOCKET_ALLOWING_CONNECT = 1 << 6;
    }
}

bitflags::bitflags! {
    /// File-related signals that listeners can watch for, in addition to
    /// state changes.
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct FileSignals: u32 {
        /// The read buffer now has additional data available to read.
        const READ_BUFFER_GREW = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Flags kept in the descriptor table slot rather than on the file
    /// object.
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DescriptorFlags: u32 {
        const FD_CLOEXEC = 1;
    }
}

/// A wrapper for any type of file object.
#[derive(Clone)]
pub enum File {
    Pipe(Arc<AtomicRefCell<pipe::Pipe>>),
    EventFd(Arc<AtomicRefCell<eventfd::EventFd>>),
    TimerFd(Arc<AtomicRefCell<timerfd::TimerFd>>),
    Epoll(Arc<AtomicRefCell<epoll::Epoll>>),
    RegularFile(Arc<AtomicRefCell<regular_file::RegularFile>>),
    Socket(Socket),
}

// will not compile if `File` is not Send + Sync
impl IsSend for File {}
impl IsSync for File {}

impl File {
    pub fn borrow(&self) -> FileRef {
        match self {
            Self::Pipe(f) => FileRef::Pipe(f.borrow()),
            Self::EventFd(f) => FileRef::EventFd(f.borrow()),
            Self::TimerFd(f) => FileRef::TimerFd(f.borrow()),
            Self::Epoll(f) => FileRef::Epoll(f.borrow()),
            Self::RegularFile(f) => FileRef::RegularFile(f.borrow()),
            Self::Socket(f) => FileRef::Socket(f.borrow()),
        }
    }

    pub fn borrow_mut(&self) -> FileRefMut {
        match self {
            Self::Pipe(f) => FileRefMut::Pipe(f.borrow_mut()),
            Self::EventFd(f) => FileRefMut::EventFd(f.borrow_mut()),
            Self::TimerFd(f) => FileRefMut::TimerFd(f.borrow_mut()),
            Self::Epoll(f) => FileRefMut::Epoll(f.borrow_mut()),
            Self::RegularFile(f) => FileRefMut::RegularFile(f.borrow_mut()),
            Self::Socket(f) => FileRefMut::Socket(f.borrow_mut()),
        }
    }

    /// A handle identifying the underlying file object; two `File`s refer to
    /// the same object iff their handles are equal.
    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Pipe(f) => Arc::as_ptr(f) as usize,
            Self::EventFd(f) => Arc::as_ptr(f) as usize,
            Self::TimerFd(f) => Arc::as_ptr(f) as usize,
            Self::Epoll(f) => Arc::as_ptr(f) as usize,
            Self::RegularFile(f) => Arc::as_ptr(f) as usize,
            Self::Socket(f) => f.canonical_handle(),
        }
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe(_) => write!(f, "Pipe")?,
            Self::EventFd(_) => write!(f, "EventFd")?,
            Self::TimerFd(_) => write!(f, "TimerFd")?,
            Self::Epoll(_) => write!(f, "Epoll")?,
            Self::RegularFile(_) => write!(f, "RegularFile")?,
            Self::Socket(_) => write!(f, "Socket")?,
        }

        let file = self.borrow();
        write!(f, "(state: {:?}, status: {:?})", file.state(), file.status())
    }
}

/// Wraps an immutably borrowed [`File`].
pub enum FileRef<'a> {
    Pipe(atomic_refcell::AtomicRef<'a, pipe::Pipe>),
    EventFd(atomic_refcell::AtomicRef<'a, eventfd::EventFd>),
    TimerFd(atomic_refcell::AtomicRef<'a, timerfd::TimerFd>),
    Epoll(atomic_refcell::AtomicRef<'a, epoll::Epoll>),
    RegularFile(atomic_refcell::AtomicRef<'a, regular_file::RegularFile>),
    Socket(SocketRef<'a>),
}

/// Wraps a mutably borrowed [`File`].
pub enum FileRefMut<'a> {
    Pipe(atomic_refcell::AtomicRefMut<'a, pipe::Pipe>),
    EventFd(atomic_refcell::AtomicRefMut<'a, eventfd::EventFd>),
    TimerFd(atomic_refcell::AtomicRefMut<'a, timerfd::TimerFd>),
    Epoll(atomic_refcell::AtomicRefMut<'a, epoll::Epoll>),
    RegularFile(atomic_refcell::AtomicRefMut<'a, regular_file::RegularFile>),
    Socket(SocketRefMut<'a>),
}

impl FileRef<'_> {
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn supports_sa_restart(&self) -> bool
    );
}

impl FileRefMut<'_> {
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn supports_sa_restart(&self) -> bool
    );
    enum_passthrough!(self, (val), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn set_has_open_file(&mut self, val: bool)
    );
    enum_passthrough!(self, (cb_queue), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (status), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn set_status(&mut self, status: FileStatus)
    );
    enum_passthrough!(self, (request, arg_ptr, memory_manager), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn ioctl(&mut self, request: u64, arg_ptr: ForeignPtr<()>, memory_manager: &mut MemoryManager) -> SyscallResult
    );
    enum_passthrough!(self, (monitoring_state, monitoring_signals, filter, notify_fn), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn add_listener(
            &mut self,
            monitoring_state: FileState,
            monitoring_signals: FileSignals,
            filter: StateListenerFilter,
            notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue) + Send + Sync + 'static,
        ) -> StateListenHandle
    );
    enum_passthrough!(self, (iovs, offset, flags, mem, cb_queue), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn readv(&mut self, iovs: &[IoVec], offset: Option<libc::off_t>, flags: libc::c_int,
                     mem: &mut MemoryManager, cb_queue: &mut CallbackQueue) -> Result<libc::ssize_t, SyscallError>
    );
    enum_passthrough!(self, (iovs, offset, flags, mem, cb_queue), Pipe, EventFd, TimerFd, Epoll, RegularFile, Socket;
        pub fn writev(&mut self, iovs: &[IoVec], offset: Option<libc::off_t>, flags: libc::c_int,
                      mem: &mut MemoryManager, cb_queue: &mut CallbackQueue) -> Result<libc::ssize_t, SyscallError>
    );
}

/// Represents a POSIX file description, or a Linux `struct file`. An
/// `OpenFile` wraps a reference to a [`File`]. Once there are no more
/// `OpenFile` objects for a given `File`, the `File` will be closed.
///
/// **Warning:** If an `OpenFile` for a specific file already exists, it is an
/// error to create a new `OpenFile` for that file. You must clone the
/// existing `OpenFile` object.
#[derive(Clone, Debug)]
pub struct OpenFile {
    inner: Arc<OpenFileInner>,
}

impl IsSend for OpenFile {}
impl IsSync for OpenFile {}

impl OpenFile {
    pub fn new(file: File) -> Self {
        {
            let mut file = file.borrow_mut();

            if file.state().contains(FileState::CLOSED) {
                debug_panic!("Creating an `OpenFile` object for a closed file");
            }

            if file.has_open_file() {
                debug_panic!(
                    "Creating an `OpenFile` object for a file that already has an `OpenFile`"
                );
            }

            file.set_has_open_file(true);
        }

        Self {
            inner: Arc::new(OpenFileInner { file: Some(file) }),
        }
    }

    pub fn inner_file(&self) -> &File {
        self.inner.file.as_ref().unwrap()
    }

    /// Will close the inner `File` object if this is the last `OpenFile` for
    /// that `File`. This behaviour is the same as simply dropping this
    /// `OpenFile` object, but allows you to pass a callback queue and get the
    /// return value of the close operation.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<Result<(), SyscallError>> {
        let OpenFile { inner } = self;

        // if this is the last reference, call close() on the file
        Arc::into_inner(inner).map(|mut inner| inner.close_helper(cb_queue))
    }
}

#[derive(Debug)]
struct OpenFileInner {
    file: Option<File>,
}

impl OpenFileInner {
    fn close_helper(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        if let Some(file) = self.file.take() {
            file.borrow_mut().close(cb_queue)?;
        }
        Ok(())
    }
}

impl std::ops::Drop for OpenFileInner {
    fn drop(&mut self) {
        // ignore any return value
        let _ = CallbackQueue::queue_and_run(|cb_queue| self.close_helper(cb_queue));
    }
}

/// A file descriptor that references an open file, plus the flags that change
/// the behaviour of this descriptor.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// The file that this descriptor points to.
    file: OpenFile,
    /// Descriptor flags.
    flags: DescriptorFlags,
}

impl IsSend for Descriptor {}
impl IsSync for Descriptor {}

impl Descriptor {
    pub fn new(file: OpenFile) -> Self {
        Self {
            file,
            flags: DescriptorFlags::empty(),
        }
    }

    pub fn open_file(&self) -> &OpenFile {
        &self.file
    }

    pub fn file(&self) -> &File {
        self.file.inner_file()
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags = flags;
    }

    /// Close the descriptor, closing the file if this was the last open
    /// descriptor for it.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<Result<(), SyscallError>> {
        self.file.close(cb_queue)
    }

    /// Duplicate the descriptor, with both descriptors pointing to the same
    /// `OpenFile`. In Linux, the descriptor flags aren't typically copied to
    /// the new descriptor, so we explicitly require a flags value to avoid
    /// confusion.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        Self {
            file: self.file.clone(),
            flags,
        }
    }
}

