/*!
A queue of bytes that supports both stream semantics (reads may span what
were separate writes) and packet semantics (each read returns exactly one
earlier write). Used as the backing store for pipe buffers.
*/

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkType {
    Stream,
    Packet,
}

#[derive(Debug)]
struct ByteChunk {
    data: Bytes,
    chunk_type: ChunkType,
}

/// A queue of bytes, kept as a list of chunks.
pub struct ByteQueue {
    chunks: VecDeque<ByteChunk>,
    length: usize,
    /// Preferred allocation size for stream chunks.
    chunk_capacity: usize,
}

impl ByteQueue {
    pub fn new(chunk_capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            length: 0,
            chunk_capacity,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.length
    }

    pub fn has_chunks(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Push at most `len` stream bytes from the reader. Returns the number of
    /// bytes pushed.
    pub fn push_stream<R: std::io::Read>(&mut self, mut src: R, len: usize) -> std::io::Result<usize> {
        let mut total = 0;

        while total < len {
            let this_chunk = std::cmp::min(self.chunk_capacity, len - total);
            let mut buf = BytesMut::zeroed(this_chunk);

            let copied = src.read(&mut buf)?;
            if copied == 0 {
                break;
            }

            buf.truncate(copied);
            self.chunks.push_back(ByteChunk {
                data: buf.freeze(),
                chunk_type: ChunkType::Stream,
            });
            self.length += copied;
            total += copied;
        }

        Ok(total)
    }

    /// Push exactly `len` bytes from the reader as a single packet.
    pub fn push_packet<R: std::io::Read>(&mut self, mut src: R, len: usize) -> std::io::Result<()> {
        let mut buf = BytesMut::zeroed(len);
        src.read_exact(&mut buf)?;

        self.chunks.push_back(ByteChunk {
            data: buf.freeze(),
            chunk_type: ChunkType::Packet,
        });
        self.length += len;

        Ok(())
    }

    /// Pop up to `len` bytes into the writer. Stream chunks coalesce; a
    /// packet chunk is consumed whole with any excess beyond `len` dropped.
    /// Returns `(bytes copied, bytes removed from the queue, chunk type)`.
    pub fn pop<W: std::io::Write>(
        &mut self,
        mut dst: W,
        len: usize,
    ) -> std::io::Result<Option<(usize, usize, ChunkType)>> {
        let first_type = match self.chunks.front() {
            Some(chunk) => chunk.chunk_type,
            None => return Ok(None),
        };

        match first_type {
            ChunkType::Stream => {
                let mut copied = 0;

                while copied < len {
                    let Some(front) = self.chunks.front_mut() else {
                        break;
                    };
                    if front.chunk_type != ChunkType::Stream {
                        break;
                    }

                    let take = std::cmp::min(front.data.len(), len - copied);
                    dst.write_all(&front.data[..take])?;
                    copied += take;
                    self.length -= take;

                    if take == front.data.len() {
                        self.chunks.pop_front();
                    } else {
                        front.data = front.data.slice(take..);
                    }
                }

                Ok(Some((copied, copied, ChunkType::Stream)))
            }
            ChunkType::Packet => {
                let chunk = self.chunks.pop_front().unwrap();
                let size = chunk.data.len();
                let copied = std::cmp::min(size, len);

                dst.write_all(&chunk.data[..copied])?;
                self.length -= size;

                Ok(Some((copied, size, ChunkType::Packet)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_coalesces() {
        let mut queue = ByteQueue::new(8);

        queue.push_stream(&b"hello "[..], 6).unwrap();
        queue.push_stream(&b"world"[..], 5).unwrap();
        assert_eq!(queue.num_bytes(), 11);

        let mut out = Vec::new();
        let (copied, removed, chunk_type) = queue.pop(&mut out, 100).unwrap().unwrap();
        assert_eq!(copied, 11);
        assert_eq!(removed, 11);
        assert_eq!(chunk_type, ChunkType::Stream);
        assert_eq!(&out, b"hello world");
        assert_eq!(queue.num_bytes(), 0);
    }

    #[test]
    fn test_stream_partial_pop() {
        let mut queue = ByteQueue::new(4);
        queue.push_stream(&b"abcdef"[..], 6).unwrap();

        let mut out = Vec::new();
        let (copied, _, _) = queue.pop(&mut out, 4).unwrap().unwrap();
        assert_eq!(copied, 4);
        assert_eq!(&out, b"abcd");

        out.clear();
        let (copied, _, _) = queue.pop(&mut out, 4).unwrap().unwrap();
        assert_eq!(copied, 2);
        assert_eq!(&out, b"ef");
    }

    #[test]
    fn test_packet_boundaries_kept() {
        let mut queue = ByteQueue::new(64);
        queue.push_packet(&b"one"[..], 3).unwrap();
        queue.push_packet(&b"twotwo"[..], 6).unwrap();

        let mut out = Vec::new();
        let (copied, removed, chunk_type) = queue.pop(&mut out, 100).unwrap().unwrap();
        assert_eq!((copied, removed, chunk_type), (3, 3, ChunkType::Packet));
        assert_eq!(&out, b"one");

        // a short read truncates the packet; the rest is discarded
        out.clear();
        let (copied, removed, _) = queue.pop(&mut out, 3).unwrap().unwrap();
        assert_eq!((copied, removed), (3, 6));
        assert_eq!(&out, b"two");
        assert_eq!(queue.num_bytes(), 0);
    }

    #[test]
    fn test_empty_pop() {
        let mut queue = ByteQueue::new(8);
        let mut out = Vec::new();
        assert!(queue.pop(&mut out, 10).unwrap().is_none());
    }
}
