//! The buffer behind a pair of pipe ends (or anything else where several
//! files read and write one stream). The buffer knows how many reading and
//! writing endpoints are attached, and every mutation re-derives a state
//! snapshot and notifies listeners of whatever flipped.

use nix::errno::Errno;

use crate::utility::byte_queue::ByteQueue;
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

bitflags::bitflags! {
    /// The observable condition of the buffer. Derived on demand, never
    /// stored as ground truth.
    #[derive(Default, Copy, Clone, Debug)]
    pub struct BufferState: u8 {
        /// There is data waiting in the buffer.
        const READABLE = 1 << 0;
        /// There is available buffer space.
        const WRITABLE = 1 << 1;
        /// The buffer has no readers.
        const NO_READERS = 1 << 2;
        /// The buffer has no writers.
        const NO_WRITERS = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Default, Copy, Clone, Debug)]
    pub struct BufferSignals: u8 {
        /// The buffer now has additional data available to read.
        const BUFFER_GREW = 1 << 0;
    }
}

pub type BufferHandle = Handle<(BufferState, BufferState, BufferSignals)>;

/// Which side of the buffer an endpoint participates in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PortRole {
    Reader,
    Writer,
}

/// Proof that an endpoint is attached. Obtained from
/// [`attach_reader`](SharedBuf::attach_reader) or
/// [`attach_writer`](SharedBuf::attach_writer) and must be returned through
/// [`detach`](SharedBuf::detach) so the buffer's end-of-stream accounting
/// stays correct. Not `Clone`: one handle, one endpoint.
#[derive(Debug)]
pub struct PortHandle(PortRole);

pub struct SharedBuf {
    queue: ByteQueue,
    capacity: usize,
    readers: u16,
    writers: u16,
    /// The snapshot listeners saw most recently; deltas are computed
    /// against this.
    last_notified: BufferState,
    event_source: EventSource<(BufferState, BufferState, BufferSignals)>,
}

impl SharedBuf {
    pub fn new(capacity: usize) -> Self {
        assert_ne!(capacity, 0);

        let mut buf = Self {
            queue: ByteQueue::new(4096),
            capacity,
            readers: 0,
            writers: 0,
            last_notified: BufferState::empty(),
            event_source: EventSource::new(),
        };

        // seed the delta baseline with the real starting condition
        buf.last_notified = buf.current_state();
        buf
    }

    fn current_state(&self) -> BufferState {
        let mut state = BufferState::empty();
        state.set(BufferState::READABLE, self.has_data());
        state.set(BufferState::WRITABLE, self.space_available() > 0);
        state.set(BufferState::NO_READERS, self.readers == 0);
        state.set(BufferState::NO_WRITERS, self.writers == 0);
        state
    }

    pub fn state(&self) -> BufferState {
        self.current_state()
    }

    pub fn has_data(&self) -> bool {
        self.queue.has_chunks()
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.queue.num_bytes()
    }

    pub fn max_len(&self) -> usize {
        self.capacity
    }

    pub fn space_available(&self) -> usize {
        self.capacity - self.queue.num_bytes()
    }

    pub fn num_readers(&self) -> u16 {
        self.readers
    }

    pub fn num_writers(&self) -> u16 {
        self.writers
    }

    pub fn attach_reader(&mut self, cb_queue: &mut CallbackQueue) -> PortHandle {
        self.readers += 1;
        self.after_change(BufferSignals::empty(), cb_queue);
        PortHandle(PortRole::Reader)
    }

    pub fn attach_writer(&mut self, cb_queue: &mut CallbackQueue) -> PortHandle {
        self.writers += 1;
        self.after_change(BufferSignals::empty(), cb_queue);
        PortHandle(PortRole::Writer)
    }

    /// Return an endpoint handle. When the last writer detaches the buffer
    /// turns end-of-stream for its readers; when the last reader detaches,
    /// writers start seeing a broken pipe.
    pub fn detach(&mut self, handle: PortHandle, cb_queue: &mut CallbackQueue) {
        match handle.0 {
            PortRole::Reader => self.readers -= 1,
            PortRole::Writer => self.writers -= 1,
        }
        self.after_change(BufferSignals::empty(), cb_queue);
    }

    /// Copy up to `len` buffered bytes into `dst`. Returns the number
    /// copied (zero when the buffer is empty).
    pub fn read<W: std::io::Write>(
        &mut self,
        dst: W,
        len: usize,
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, std::io::Error> {
        let num_copied = match self.queue.pop(dst, len)? {
            Some((num_copied, _num_removed, _chunk_type)) => num_copied,
            None => 0,
        };

        self.after_change(BufferSignals::empty(), cb_queue);
        Ok(num_copied)
    }

    /// Buffer up to `len` stream bytes from `src`, bounded by the free
    /// space. Fails with `EAGAIN` when completely full.
    pub fn write_stream<R: std::io::Read>(
        &mut self,
        src: R,
        len: usize,
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, std::io::Error> {
        if len == 0 {
            return Ok(0);
        }

        let space = self.space_available();
        if space == 0 {
            return Err(Errno::EAGAIN.into());
        }

        let written = self.queue.push_stream(src, len.min(space))?;

        let signals = if written > 0 {
            BufferSignals::BUFFER_GREW
        } else {
            BufferSignals::empty()
        };
        self.after_change(signals, cb_queue);

        Ok(written)
    }

    /// Buffer exactly `len` bytes as one indivisible message. Fails with
    /// `EMSGSIZE` if the message could never fit, and `EAGAIN` if it merely
    /// doesn't fit right now.
    pub fn write_packet<R: std::io::Read>(
        &mut self,
        src: R,
        len: usize,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), std::io::Error> {
        if len > self.capacity {
            return Err(Errno::EMSGSIZE.into());
        }
        if len > self.space_available() {
            return Err(Errno::EAGAIN.into());
        }

        self.queue.push_packet(src, len)?;
        self.after_change(BufferSignals::BUFFER_GREW, cb_queue);

        Ok(())
    }

    /// Subscribe to state flips and signals. The notify function only hears
    /// about bits and signals in the given masks.
    pub fn add_listener(
        &mut self,
        state_mask: BufferState,
        signal_mask: BufferSignals,
        notify_fn: impl Fn(BufferState, BufferSignals, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> BufferHandle {
        self.event_source
            .add_listener(move |(state, changed, signals), cb_queue| {
                let relevant_flip = state_mask.intersects(changed);
                let relevant_signals = signals & signal_mask;

                if relevant_flip || !relevant_signals.is_empty() {
                    (notify_fn)(state, relevant_signals, cb_queue)
                }
            })
    }

    /// Recompute the state snapshot and tell listeners what changed, if
    /// anything did.
    fn after_change(&mut self, signals: BufferSignals, cb_queue: &mut CallbackQueue) {
        let state = self.current_state();
        let changed = state ^ self.last_notified;

        if changed.is_empty() && signals.is_empty() {
            return;
        }

        self.last_notified = state;
        self.event_source
            .notify_listeners((state, changed, signals), cb_queue);
    }
}

impl Drop for SharedBuf {
    fn drop(&mut self) {
        // every endpoint must have detached, otherwise someone may still be
        // waiting on a NO_READERS/NO_WRITERS flip that can never come
        debug_assert!(
            std::thread::panicking() || (self.readers == 0 && self.writers == 0),
            "SharedBuf dropped with {} readers and {} writers still attached",
            self.readers,
            self.writers,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_all(buf: &mut SharedBuf, bytes: &[u8]) -> usize {
        CallbackQueue::queue_and_run(|cb_queue| {
            buf.write_stream(bytes, bytes.len(), cb_queue).unwrap()
        })
    }

    fn read_some(buf: &mut SharedBuf, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let copied =
            CallbackQueue::queue_and_run(|cb_queue| buf.read(&mut out, len, cb_queue).unwrap());
        assert_eq!(copied, out.len());
        out
    }

    #[test]
    fn test_stream_roundtrip_and_state() {
        let mut buf = SharedBuf::new(16);
        assert!(buf
            .state()
            .contains(BufferState::WRITABLE | BufferState::NO_READERS | BufferState::NO_WRITERS));

        assert_eq!(write_all(&mut buf, b"abcdef"), 6);
        assert!(buf.state().contains(BufferState::READABLE));
        assert_eq!(buf.len(), 6);

        assert_eq!(read_some(&mut buf, 4), b"abcd");
        assert_eq!(read_some(&mut buf, 4), b"ef");
        assert!(!buf.state().contains(BufferState::READABLE));
    }

    #[test]
    fn test_fills_to_capacity() {
        let mut buf = SharedBuf::new(4);

        // a long write is clipped to the free space
        assert_eq!(write_all(&mut buf, b"abcdef"), 4);
        assert!(!buf.state().contains(BufferState::WRITABLE));

        // and a full buffer rejects further writes outright
        let err = CallbackQueue::queue_and_run(|cb_queue| {
            buf.write_stream(&b"x"[..], 1, cb_queue).unwrap_err()
        });
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));

        read_some(&mut buf, 4);
        assert!(buf.state().contains(BufferState::WRITABLE));
    }

    #[test]
    fn test_endpoint_accounting() {
        let mut buf = SharedBuf::new(16);

        let (reader, writer) = CallbackQueue::queue_and_run(|cb_queue| {
            (buf.attach_reader(cb_queue), buf.attach_writer(cb_queue))
        });

        assert_eq!(buf.num_readers(), 1);
        assert_eq!(buf.num_writers(), 1);
        assert!(!buf.state().intersects(BufferState::NO_READERS | BufferState::NO_WRITERS));

        CallbackQueue::queue_and_run(|cb_queue| buf.detach(writer, cb_queue));
        assert!(buf.state().contains(BufferState::NO_WRITERS));

        CallbackQueue::queue_and_run(|cb_queue| buf.detach(reader, cb_queue));
        assert!(buf.state().contains(BufferState::NO_READERS));
    }

    #[test]
    fn test_listener_hears_masked_flips_only() {
        let mut buf = SharedBuf::new(4);

        let flips = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let flips_clone = std::sync::Arc::clone(&flips);

        let handle = buf.add_listener(
            BufferState::READABLE,
            BufferSignals::empty(),
            move |_state, _signals, _cb_queue| {
                flips_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
        );

        // readable flips on
        write_all(&mut buf, b"ab");
        assert_eq!(flips.load(std::sync::atomic::Ordering::SeqCst), 1);

        // more data arrives but READABLE never flips; no notification
        write_all(&mut buf, b"c");
        assert_eq!(flips.load(std::sync::atomic::Ordering::SeqCst), 1);

        // draining flips it off
        read_some(&mut buf, 4);
        assert_eq!(flips.load(std::sync::atomic::Ordering::SeqCst), 2);

        handle.stop_listening();
    }

    #[test]
    fn test_packet_write_bounds() {
        let mut buf = SharedBuf::new(8);

        CallbackQueue::queue_and_run(|cb_queue| {
            // too large for the buffer, ever
            let err = buf.write_packet(&b"0123456789"[..], 10, cb_queue).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EMSGSIZE));

            buf.write_packet(&b"abcde"[..], 5, cb_queue).unwrap();

            // would fit an empty buffer, but not right now
            let err = buf.write_packet(&b"wxyz"[..], 4, cb_queue).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
        });

        assert_eq!(read_some(&mut buf, 8), b"abcde");
    }
}
