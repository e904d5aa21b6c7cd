//! Circular buffer holding the scrollback of a command stream.
//!
//! Keeps the last N bytes written to a stream so that an observer attaching
//! late can rebuild what it missed without the process keeping unbounded
//! history. [`RingBuffer`] is the unsynchronised core; [`Scrollback`] is the
//! shared, locked handle handed out to callers.

use crate::lock;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// A fixed-capacity circular byte buffer.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<u8>,
    /// Next write position. The most recent byte sits just before it.
    head: usize,
    /// Number of valid bytes, never more than the capacity.
    len: usize,
    /// Total bytes ever written (survives resizes).
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Reallocate to `capacity`, keeping the most recent bytes that fit.
    ///
    /// Resizing to zero drops everything; later reads return nothing.
    pub fn resize(&mut self, capacity: usize) {
        let mut buf = vec![0u8; capacity];
        let kept = self.last(&mut buf);
        self.head = if capacity > 0 { kept % capacity } else { 0 };
        self.len = kept;
        self.buf = buf;
    }

    /// Fill `out` with the most recently written bytes, oldest first.
    ///
    /// Returns how many bytes were copied: `min(out.len(), len)`. Read-only,
    /// so repeated calls without a write in between give the same answer.
    pub fn last(&self, out: &mut [u8]) -> usize {
        let want = out.len().min(self.len);
        if want <= self.head {
            out[..want].copy_from_slice(&self.buf[self.head - want..self.head]);
            return want;
        }
        // Wrapped: the older part lives at the end of the backing vec.
        let older = want - self.head;
        let cap = self.buf.len();
        out[..older].copy_from_slice(&self.buf[cap - older..]);
        out[older..want].copy_from_slice(&self.buf[..self.head]);
        want
    }

    /// Append data, overwriting the oldest bytes when full.
    ///
    /// Never fails and always reports `data.len()`, even when only the
    /// trailing `capacity` bytes are kept.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len();
        self.total_written += n as u64;

        let cap = self.buf.len();
        if cap == 0 {
            return n;
        }

        let tail = if n > cap { &data[n - cap..] } else { data };
        let room = cap - self.head;
        if tail.len() <= room {
            self.buf[self.head..self.head + tail.len()].copy_from_slice(tail);
            self.head = (self.head + tail.len()) % cap;
        } else {
            let (first, second) = tail.split_at(room);
            self.buf[self.head..].copy_from_slice(first);
            self.buf[..second.len()].copy_from_slice(second);
            self.head = second.len();
        }
        self.len = (self.len + tail.len()).min(cap);
        n
    }

    /// All retained bytes in chronological order.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        let n = self.last(&mut out);
        out.truncate(n);
        out
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes ever written through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

/// Thread-safe, cloneable handle to a [`RingBuffer`].
///
/// Clones share the same buffer. Every operation takes the buffer's lock, so
/// concurrent size, resize, read and write calls are serialised.
#[derive(Debug, Clone)]
pub struct Scrollback {
    inner: Arc<Mutex<RingBuffer>>,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(capacity))),
        }
    }

    pub fn size(&self) -> usize {
        lock(&self.inner).size()
    }

    pub fn resize(&self, capacity: usize) {
        lock(&self.inner).resize(capacity);
    }

    pub fn last(&self, out: &mut [u8]) -> usize {
        lock(&self.inner).last(out)
    }

    pub fn write(&self, data: &[u8]) -> usize {
        lock(&self.inner).write(data)
    }

    /// Write the entire retained contents to `w` in one call.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<u64> {
        let data = self.snapshot();
        w.write_all(&data)?;
        Ok(data.len() as u64)
    }

    /// Copy of all retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.inner).read_all()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    pub fn total_written(&self) -> u64 {
        lock(&self.inner).total_written()
    }
}

impl Write for Scrollback {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(Scrollback::write(self, data))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_n(rb: &RingBuffer, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        let got = rb.last(&mut out);
        out.truncate(got);
        out
    }

    #[test]
    fn basic_write_read() {
        let mut rb = RingBuffer::new(10);
        assert_eq!(rb.write(b"hello"), 5);
        assert_eq!(rb.read_all(), b"hello");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let mut rb = RingBuffer::new(5);
        let n = rb.write(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(n, 10);
        assert_eq!(last_n(&rb, 3), vec![7, 8, 9]);

        rb.write(&[10, 11, 12]);
        assert_eq!(last_n(&rb, 20), vec![8, 9, 10, 11, 12]);
        assert_eq!(rb.total_written(), 13);
    }

    #[test]
    fn wrap_around() {
        let mut rb = RingBuffer::new(5);
        rb.write(b"abcde");
        rb.write(b"fg");
        assert_eq!(rb.read_all(), b"cdefg");
        assert_eq!(rb.len(), 5);

        // Split write straddling the end of the backing vec.
        rb.write(b"hij");
        assert_eq!(rb.read_all(), b"fghij");
    }

    #[test]
    fn last_is_read_only() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"abcdef");
        assert_eq!(last_n(&rb, 2), b"ef");
        assert_eq!(last_n(&rb, 2), b"ef");
        assert_eq!(last_n(&rb, 0), b"");
    }

    #[test]
    fn many_small_writes_match_stream_suffix() {
        let mut rb = RingBuffer::new(7);
        let mut stream = Vec::new();
        for i in 0..50u8 {
            let chunk: Vec<u8> = (0..(i % 4)).map(|j| i.wrapping_mul(3).wrapping_add(j)).collect();
            rb.write(&chunk);
            stream.extend_from_slice(&chunk);
            let keep = stream.len().min(7);
            assert_eq!(rb.read_all(), &stream[stream.len() - keep..]);
        }
    }

    #[test]
    fn resize_down_keeps_most_recent() {
        let mut rb = RingBuffer::new(10);
        rb.write(b"0123456789ab");
        rb.resize(4);
        assert_eq!(rb.size(), 4);
        assert_eq!(rb.read_all(), b"89ab");
        rb.write(b"c");
        assert_eq!(rb.read_all(), b"9abc");
    }

    #[test]
    fn resize_up_preserves_contents() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"abcdef");
        rb.resize(8);
        assert_eq!(rb.read_all(), b"cdef");
        rb.write(b"ghijk");
        assert_eq!(rb.read_all(), b"defghijk");
    }

    #[test]
    fn resize_to_zero_discards() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"abc");
        rb.resize(0);
        assert!(rb.is_empty());
        rb.write(b"more");
        assert_eq!(last_n(&rb, 10), b"");
        assert_eq!(rb.total_written(), 7);

        rb.resize(3);
        assert!(rb.is_empty());
        rb.write(b"xy");
        assert_eq!(rb.read_all(), b"xy");
    }

    #[test]
    fn empty_buffer() {
        let rb = RingBuffer::new(10);
        assert!(rb.is_empty());
        assert_eq!(rb.read_all(), Vec::<u8>::new());
    }

    #[test]
    fn scrollback_handle_shares_state() {
        let sb = Scrollback::new(6);
        let other = sb.clone();
        sb.write(b"hello world");
        assert_eq!(other.snapshot(), b" world");

        let mut out = Vec::new();
        let n = other.write_to(&mut out).unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, b" world");
    }

    #[test]
    fn scrollback_concurrent_writers_keep_whole_chunks() {
        let sb = Scrollback::new(64);
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let sb = sb.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        sb.write(&[b'a' + t; 8]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let data = sb.snapshot();
        assert_eq!(data.len(), 64);
        assert_eq!(sb.total_written(), 4 * 200 * 8);
        for chunk in data.chunks(8) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }
}
