//! Byte containers shared between the I/O layer and codecs.
//!
//! All containers expose segment-oriented access so vectored reads and
//! writes can work on contiguous chunks, plus byte-level push/pop. A full
//! container refuses bytes with a recoverable error; nothing is dropped.

use crate::error::{Code, Error, Result};

/// Segment-oriented byte container.
pub trait Buffer {
    /// Bytes ready to be read.
    fn readable(&self) -> usize;
    /// Bytes that can be written before the container must refuse.
    fn writable(&self) -> usize;

    /// The contiguous readable segment at the read cursor.
    fn read_segment(&self) -> &[u8];
    fn advance_read(&mut self, n: usize);

    /// The contiguous writable segment at the write cursor.
    fn write_segment(&mut self) -> &mut [u8];
    fn advance_write(&mut self, n: usize);

    /// Byte at `offset` past the read cursor, if readable.
    fn peek(&self, offset: usize) -> Option<u8>;

    /// Ensures at least `n` bytes can be written, growing if the container
    /// supports it.
    fn require_write_capacity(&mut self, n: usize) -> Result<()>;

    fn push(&mut self, value: u8) -> Result<()> {
        self.push_slice(std::slice::from_ref(&value))
    }

    fn push_slice(&mut self, values: &[u8]) -> Result<()> {
        if self.writable() < values.len() {
            return Err(Error::new(Code::BufferFull, "buffer cannot take more data"));
        }
        let mut written = 0;
        while written < values.len() {
            let segment = self.write_segment();
            let n = segment.len().min(values.len() - written);
            segment[..n].copy_from_slice(&values[written..written + n]);
            self.advance_write(n);
            written += n;
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<u8> {
        let mut value = [0u8];
        self.pop_slice(&mut value)?;
        Ok(value[0])
    }

    fn pop_slice(&mut self, out: &mut [u8]) -> Result<()> {
        if self.readable() < out.len() {
            return Err(Error::new(
                Code::NotAvailable,
                "buffer holds fewer bytes than requested",
            ));
        }
        let mut read = 0;
        while read < out.len() {
            let segment = self.read_segment();
            let n = segment.len().min(out.len() - read);
            out[read..read + n].copy_from_slice(&segment[..n]);
            self.advance_read(n);
            read += n;
        }
        Ok(())
    }
}

pub(crate) const RING_BUFFER_DEFAULT_SIZE: usize = 4096;

/// Fixed-capacity buffer wrapping around when the read cursor caught up.
pub struct RingBuffer {
    data: Vec<u8>,
    read_pos: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new() -> RingBuffer {
        RingBuffer::with_capacity(RING_BUFFER_DEFAULT_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> RingBuffer {
        assert!(capacity > 0, "ring buffer needs a non-zero capacity");
        RingBuffer {
            data: vec![0; capacity],
            read_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn write_pos(&self) -> usize {
        (self.read_pos + self.len) % self.capacity()
    }
}

impl Default for RingBuffer {
    fn default() -> RingBuffer {
        RingBuffer::new()
    }
}

impl Buffer for RingBuffer {
    fn readable(&self) -> usize {
        self.len
    }

    fn writable(&self) -> usize {
        self.capacity() - self.len
    }

    fn read_segment(&self) -> &[u8] {
        let end = (self.read_pos + self.len).min(self.capacity());
        &self.data[self.read_pos..end]
    }

    fn advance_read(&mut self, n: usize) {
        let n = n.min(self.len);
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.len -= n;
    }

    fn write_segment(&mut self) -> &mut [u8] {
        let write_pos = self.write_pos();
        let end = if write_pos >= self.read_pos || self.len == 0 {
            self.capacity()
        } else {
            self.read_pos
        };
        // A full buffer exposes an empty segment at the write cursor.
        let end = if self.is_full() { write_pos } else { end };
        &mut self.data[write_pos..end]
    }

    fn advance_write(&mut self, n: usize) {
        let n = n.min(self.writable());
        self.len += n;
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.data[(self.read_pos + offset) % self.capacity()])
    }

    fn require_write_capacity(&mut self, n: usize) -> Result<()> {
        if self.writable() < n {
            return Err(Error::new(
                Code::BufferFull,
                "ring buffer cannot grow on demand",
            ));
        }
        Ok(())
    }
}

/// One-shot linear buffer; grows on demand.
pub struct ArrayBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ArrayBuffer {
    pub fn with_capacity(capacity: usize) -> ArrayBuffer {
        ArrayBuffer {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }
}

impl Buffer for ArrayBuffer {
    fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn writable(&self) -> usize {
        self.data.len() - self.write_pos
    }

    fn read_segment(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    fn advance_read(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.write_pos);
    }

    fn write_segment(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    fn advance_write(&mut self, n: usize) {
        self.write_pos = (self.write_pos + n).min(self.data.len());
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.readable() {
            return None;
        }
        Some(self.data[self.read_pos + offset])
    }

    fn require_write_capacity(&mut self, n: usize) -> Result<()> {
        if self.writable() < n {
            self.data.resize(self.write_pos + n, 0);
        }
        Ok(())
    }
}

const CHAIN_SEGMENT_SIZE: usize = 4096;

/// Growing chain of array segments; reads consume from the head segment,
/// writes fill the tail.
pub struct ChainBuffer {
    segments: std::collections::VecDeque<ArrayBuffer>,
}

impl ChainBuffer {
    pub fn new() -> ChainBuffer {
        let mut segments = std::collections::VecDeque::new();
        segments.push_back(ArrayBuffer::with_capacity(CHAIN_SEGMENT_SIZE));
        ChainBuffer { segments }
    }

    fn drop_drained_head(&mut self) {
        while self.segments.len() > 1 && self.segments[0].readable() == 0 && self.segments[0].writable() == 0
        {
            self.segments.pop_front();
        }
    }
}

impl Default for ChainBuffer {
    fn default() -> ChainBuffer {
        ChainBuffer::new()
    }
}

impl Buffer for ChainBuffer {
    fn readable(&self) -> usize {
        self.segments.iter().map(|s| s.readable()).sum()
    }

    fn writable(&self) -> usize {
        // A fresh segment is appended whenever the tail runs out.
        usize::MAX
    }

    fn read_segment(&self) -> &[u8] {
        for segment in &self.segments {
            if segment.readable() > 0 {
                return segment.read_segment();
            }
        }
        &[]
    }

    fn advance_read(&mut self, mut n: usize) {
        while n > 0 {
            let Some(head) = self.segments.iter_mut().find(|s| s.readable() > 0) else {
                break;
            };
            let step = n.min(head.readable());
            head.advance_read(step);
            n -= step;
        }
        self.drop_drained_head();
    }

    fn write_segment(&mut self) -> &mut [u8] {
        if self.segments.back().map_or(0, |s| s.writable()) == 0 {
            self.segments
                .push_back(ArrayBuffer::with_capacity(CHAIN_SEGMENT_SIZE));
        }
        match self.segments.back_mut() {
            Some(tail) => tail.write_segment(),
            None => &mut [],
        }
    }

    fn advance_write(&mut self, n: usize) {
        if let Some(tail) = self.segments.back_mut() {
            tail.advance_write(n);
        }
    }

    fn peek(&self, mut offset: usize) -> Option<u8> {
        for segment in &self.segments {
            if offset < segment.readable() {
                return segment.peek(offset);
            }
            offset -= segment.readable();
        }
        None
    }

    fn require_write_capacity(&mut self, _n: usize) -> Result<()> {
        Ok(())
    }
}

/// Read-only cursor over another buffer. Mutating the underlying buffer
/// invalidates the view, which the borrow makes impossible to get wrong.
pub struct BufferView<'a, B: Buffer> {
    buffer: &'a B,
    offset: usize,
}

impl<'a, B: Buffer> BufferView<'a, B> {
    pub fn new(buffer: &'a B) -> BufferView<'a, B> {
        BufferView { buffer, offset: 0 }
    }

    /// Bytes left under the view.
    pub fn remaining(&self) -> usize {
        self.buffer.readable().saturating_sub(self.offset)
    }

    /// The view's position relative to the buffer's read cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn peek(&self) -> Option<u8> {
        self.buffer.peek(self.offset)
    }

    pub fn next(&mut self) -> Option<u8> {
        let value = self.buffer.peek(self.offset)?;
        self.offset += 1;
        Some(value)
    }

    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.buffer.readable());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_round_trip() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.push_slice(b"conveyor").unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.push(b'x').unwrap_err().code(), Code::BufferFull);

        let mut out = [0u8; 8];
        ring.pop_slice(&mut out).unwrap();
        assert_eq!(&out, b"conveyor");
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = RingBuffer::with_capacity(4);
        ring.push_slice(b"abc").unwrap();
        let mut out = [0u8; 2];
        ring.pop_slice(&mut out).unwrap();
        // Read cursor sits mid-buffer; the next push must wrap.
        ring.push_slice(b"def").unwrap();
        assert_eq!(ring.readable(), 4);
        let mut rest = [0u8; 4];
        ring.pop_slice(&mut rest).unwrap();
        assert_eq!(&rest, b"cdef");
    }

    #[test]
    fn ring_refuses_overflow_without_dropping() {
        let mut ring = RingBuffer::with_capacity(4);
        ring.push_slice(b"abcd").unwrap();
        assert!(ring.push_slice(b"e").is_err());
        let mut out = [0u8; 4];
        ring.pop_slice(&mut out).unwrap();
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn array_grows_on_demand() {
        let mut buffer = ArrayBuffer::with_capacity(2);
        buffer.require_write_capacity(6).unwrap();
        buffer.push_slice(b"abcdef").unwrap();
        assert_eq!(buffer.readable(), 6);
        assert_eq!(buffer.read_segment(), b"abcdef");
    }

    #[test]
    fn chain_spans_segments() {
        let mut chain = ChainBuffer::new();
        let big = vec![7u8; CHAIN_SEGMENT_SIZE + 10];
        chain.push_slice(&big).unwrap();
        assert_eq!(chain.readable(), big.len());

        let mut out = vec![0u8; big.len()];
        chain.pop_slice(&mut out).unwrap();
        assert_eq!(out, big);
        assert_eq!(chain.readable(), 0);
    }

    #[test]
    fn view_does_not_consume() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.push_slice(b"abc").unwrap();
        {
            let mut view = BufferView::new(&ring);
            assert_eq!(view.next(), Some(b'a'));
            assert_eq!(view.next(), Some(b'b'));
            assert_eq!(view.remaining(), 1);
        }
        assert_eq!(ring.readable(), 3);
    }
}
