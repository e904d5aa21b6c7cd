//! Downstream destinations for command output.
//!
//! A [`Sink`] receives a live copy of every byte written to an
//! [`OutStream`](crate::OutStream). Sinks are shared as [`SharedSink`] and
//! identified by pointer, so the `Arc` passed to `add_sink` is the one to
//! hand back to `remove_sink`.

use crate::{lock, CmdId};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;

/// A destination for stream bytes.
///
/// `write` must consume the whole slice or fail; an error removes the sink
/// from whatever stream it is attached to.
pub trait Sink: Send + Sync {
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Called once the feeding stream has ended. No-op by default.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// Command whose stdin this sink feeds, if any.
    fn target(&self) -> Option<CmdId> {
        None
    }
}

pub type SharedSink = Arc<dyn Sink>;

pub(crate) fn same_sink(a: &SharedSink, b: &SharedSink) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Discards everything and never fails.
#[derive(Debug, Default)]
pub struct Discard;

impl Sink for Discard {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }
}

/// The shared [`Discard`] sink.
///
/// Attached to every new command's stdout and stderr so a command nobody
/// watches yet can still run.
pub fn discard() -> SharedSink {
    static DISCARD: OnceLock<SharedSink> = OnceLock::new();
    DISCARD.get_or_init(|| Arc::new(Discard)).clone()
}

/// Collects everything written into memory.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.buf).clone()
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }

    pub fn len(&self) -> usize {
        lock(&self.buf).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.buf).is_empty()
    }
}

impl Sink for CaptureSink {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        lock(&self.buf).extend_from_slice(data);
        Ok(data.len())
    }
}

/// Adapts any [`Write`] into a sink. Each write is flushed.
pub struct WriterSink<W> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut w = lock(&self.inner);
        w.write_all(data)?;
        w.flush()?;
        Ok(data.len())
    }

    fn close(&self) -> io::Result<()> {
        lock(&self.inner).flush()
    }
}

/// Prepends a fixed prefix to every write.
///
/// The prefix and the payload go out as a single write on the wrapped sink,
/// so a message-oriented consumer sees them as one frame.
pub struct PrefixedSink {
    inner: SharedSink,
    prefix: Vec<u8>,
}

impl PrefixedSink {
    pub fn new(inner: SharedSink, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }
}

impl Sink for PrefixedSink {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut framed = Vec::with_capacity(self.prefix.len() + data.len());
        framed.extend_from_slice(&self.prefix);
        framed.extend_from_slice(data);
        self.inner.write(&framed)?;
        Ok(data.len())
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    fn target(&self) -> Option<CmdId> {
        self.inner.target()
    }
}

/// Forwards each write as an owned chunk over an unbounded channel.
///
/// This is the hand-off point to async observers (e.g. a WebSocket task).
/// Once the receiver is dropped the next write fails and the sink is pruned.
/// Closing the stream sends nothing; the receiver sees the end of the stream
/// when the sink itself is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))?;
        Ok(data.len())
    }
}
