use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use sim_support::syscall_types::ForeignPtr;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::shared_buf::{
    BufferHandle, BufferSignals, BufferState, PortHandle, SharedBuf,
};
use crate::host::descriptor::{FileMode, FileSignals, FileState, FileStatus};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::io::{IoVec, IoVecReader, IoVecWriter};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::utility::callback_queue::CallbackQueue;

pub struct Pipe {
    event_source: StateEventSource,
    state: FileState,
    mode: FileMode,
    status: FileStatus,
    write_mode: WriteMode,
    buffer: Option<Arc<AtomicRefCell<SharedBuf>>>,
    // we only store these so they're dropped when we close
    buffer_event_handle: Option<BufferHandle>,
    reader_port: Option<PortHandle>,
    writer_port: Option<PortHandle>,
    // should only be used by `OpenFile` to make sure there is only ever one
    // `OpenFile` instance for this file
    has_open_file: bool,
}

impl Pipe {
    /// Create a new [`Pipe`]. The new pipe must be initialized using
    /// [`Pipe::connect_to_buffer`] before any of its methods are called.
    pub fn new(mode: FileMode, status: FileStatus) -> Arc<AtomicRefCell<Self>> {
        Arc::new(AtomicRefCell::new(Self {
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE,
            mode,
            status,
            write_mode: WriteMode::Stream,
            buffer: None,
            buffer_event_handle: None,
            reader_port: None,
            writer_port: None,
            has_open_file: false,
        }))
    }

    pub fn connect_to_buffer(
        arc: &Arc<AtomicRefCell<Self>>,
        buffer: Arc<AtomicRefCell<SharedBuf>>,
        cb_queue: &mut CallbackQueue,
    ) {
        let weak = Arc::downgrade(arc);
        let pipe = &mut *arc.borrow_mut();

        pipe.buffer = Some(Arc::clone(&buffer));

        if pipe.mode.contains(FileMode::READ) {
            pipe.reader_port = Some(buffer.borrow_mut().attach_reader(cb_queue));
        }
        if pipe.mode.contains(FileMode::WRITE) {
            pipe.writer_port = Some(buffer.borrow_mut().attach_writer(cb_queue));
        }

        let monitoring = BufferState::all();
        let handle = buffer.borrow_mut().add_listener(
            monitoring,
            BufferSignals::BUFFER_GREW,
            move |buffer_state, signals, cb_queue| {
                // if the file hasn't been dropped
                if let Some(pipe) = weak.upgrade() {
                    let mut pipe = pipe.borrow_mut();

                    // if the pipe is already closed, do nothing
                    if pipe.state.contains(FileState::CLOSED) {
                        return;
                    }

                    let file_signals = if signals.contains(BufferSignals::BUFFER_GREW) {
                        FileSignals::READ_BUFFER_GREW
                    } else {
                        FileSignals::empty()
                    };

                    pipe.refresh_state(buffer_state, file_signals, cb_queue);
                }
            },
        );

        pipe.buffer_event_handle = Some(handle);

        // set the initial state from the buffer's state
        let buffer_state = buffer.borrow().state();
        pipe.refresh_state(buffer_state, FileSignals::empty(), cb_queue);
    }

    /// Derive this end's file state from the shared buffer's state.
    fn refresh_state(
        &mut self,
        buffer_state: BufferState,
        signals: FileSignals,
        cb_queue: &mut CallbackQueue,
    ) {
        let mut new_state = FileState::empty();

        if self.mode.contains(FileMode::READ) {
            // the read end is readable when there is data, or at
            // end-of-stream (no writers left; reads return 0)
            new_state.set(
                FileState::READABLE,
                buffer_state.intersects(BufferState::READABLE | BufferState::NO_WRITERS),
            );
            new_state.set(FileState::HUP, buffer_state.contains(BufferState::NO_WRITERS));
        }

        if self.mode.contains(FileMode::WRITE) {
            new_state.set(FileState::WRITABLE, buffer_state.contains(BufferState::WRITABLE));
            // writes to a pipe with no readers raise EPIPE
            new_state.set(FileState::ERROR, buffer_state.contains(BufferState::NO_READERS));
        }

        self.update_state(
            FileState::READABLE | FileState::WRITABLE | FileState::HUP | FileState::ERROR,
            new_state,
            signals,
            cb_queue,
        );
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

    pub fn max_size(&self) -> usize {
        self.buffer.as_ref().unwrap().borrow().max_len()
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        if self.state.contains(FileState::CLOSED) {
            return Ok(());
        }

        // drop the event listener handle so that we stop receiving new events
        self.buffer_event_handle.take();

        // return our endpoint registrations to the buffer
        if let Some(buffer) = self.buffer.take() {
            if let Some(port) = self.reader_port.take() {
                buffer.borrow_mut().detach(port, cb_queue);
            }
            if let Some(port) = self.writer_port.take() {
                buffer.borrow_mut().detach(port, cb_queue);
            }
        }

        // set the closed flag and remove the active, readable, and writable flags
        self.update_state(
            FileState::all(),
            FileState::CLOSED,
            FileSignals::empty(),
            cb_queue,
        );

        Ok(())
    }

    pub fn readv(
        &mut self,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
        _flags: libc::c_int,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        // pipes don't support seeking
        if offset.is_some() {
            return Err(Errno::ESPIPE.into());
        }

        if !self.mode.contains(FileMode::READ) {
            return Err(Errno::EBADF.into());
        }

        let len: usize = iovs.iter().map(|x| x.len).sum();
        let mut writer = IoVecWriter::new(iovs, mem);

        let buffer = self.buffer.as_ref().unwrap();
        let num_writers = buffer.borrow().num_writers();
        let num_copied = buffer.borrow_mut().read(&mut writer, len, cb_queue)?;

        // the read would block if we could not copy any bytes, we were asked
        // for bytes, and there are still writers that could produce them
        if num_copied == 0 && len != 0 && num_writers > 0 {
            return Err(Errno::EWOULDBLOCK.into());
        }

        Ok(num_copied.try_into().unwrap())
    }

    pub fn writev(
        &mut self,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
        _flags: libc::c_int,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        // pipes don't support seeking
        if offset.is_some() {
            return Err(Errno::ESPIPE.into());
        }

        if !self.mode.contains(FileMode::WRITE) {
            return Err(Errno::EBADF.into());
        }

        let buffer = self.buffer.as_ref().unwrap();

        if buffer.borrow().num_readers() == 0 {
            return Err(Errno::EPIPE.into());
        }

        let len: usize = iovs.iter().map(|x| x.len).sum();
        let mut reader = IoVecReader::new(iovs, mem);

        if self.write_mode == WriteMode::Packet && !self.status.contains(FileStatus::DIRECT) {
            // switch to stream mode immediately, regardless of whether the
            // buffer is empty or not
            self.write_mode = WriteMode::Stream;
        } else if self.write_mode == WriteMode::Stream && self.status.contains(FileStatus::DIRECT) {
            // in linux, pipes only switch to packet mode when a new page is
            // added to the buffer, so we simulate that behaviour for when the
            // first page is added (when the buffer is empty)
            if !buffer.borrow().has_data() {
                self.write_mode = WriteMode::Packet;
            }
        }

        let num_written = match self.write_mode {
            WriteMode::Stream => buffer.borrow_mut().write_stream(&mut reader, len, cb_queue)?,
            WriteMode::Packet => {
                let mut remaining = len;
                let mut written = 0;

                // pipes don't support 0-length packets
                while remaining > 0 {
                    // split the packet up into PIPE_BUF-sized chunks
                    let bytes_to_write = std::cmp::min(remaining, libc::PIPE_BUF);

                    match buffer
                        .borrow_mut()
                        .write_packet(&mut reader, bytes_to_write, cb_queue)
                    {
                        Ok(()) => {
                            written += bytes_to_write;
                            remaining -= bytes_to_write;
                        }
                        Err(e) if written > 0 => {
                            // part of the write succeeded
                            let _ = e;
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                written
            }
        };

        if num_written == 0 && len != 0 {
            return Err(Errno::EWOULDBLOCK.into());
        }

        Ok(num_written.try_into().unwrap())
    }

    pub fn ioctl(
        &mut self,
        request: u64,
        arg_ptr: ForeignPtr<()>,
        mem: &mut MemoryManager,
    ) -> SyscallResult {
        match request {
            r if r == libc::FIONREAD as u64 => {
                let len: libc::c_int = self
                    .buffer
                    .as_ref()
                    .unwrap()
                    .borrow()
                    .len()
                    .try_into()
                    .unwrap();
                mem.write_vals(arg_ptr.cast::<libc::c_int>(), &[len])?;
                Ok(0.into())
            }
            request => {
                log::warn!("We do not yet handle ioctl request {request} on pipes");
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

    fn update_state(
        &mut self,
        mask: FileState,
        state: FileState,
        signals: FileSignals,
        cb_queue: &mut CallbackQueue,
    ) {
        let old_state = self.state;

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        let states_changed = self.state ^ old_state;
        if states_changed.is_empty() && signals.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, signals, cb_queue);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WriteMode {
    Stream,
    Packet,
}
