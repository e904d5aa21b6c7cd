//! Output stream of a command: live fan-out plus scrollback.
//!
//! Every chunk is first broadcast to the attached sinks and then appended to
//! the scrollback, both under the stream's write lock, so history and live
//! observers always agree on ordering. The scrollback records everything,
//! including output written while no sink was listening.

use crate::broadcast::BroadcastWriter;
use crate::ring_buffer::Scrollback;
use crate::sink::SharedSink;
use crate::{lock, CmdId, LushError, LushResult};
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct OutStream {
    /// Serialises writes; `true` once the stream is closed.
    closed: Mutex<bool>,
    broadcast: BroadcastWriter,
    scrollback: Scrollback,
}

impl OutStream {
    /// Create a stream with no sinks and `scrollback` bytes of history.
    pub fn new(scrollback: usize) -> Self {
        Self {
            closed: Mutex::new(false),
            broadcast: BroadcastWriter::new(),
            scrollback: Scrollback::new(scrollback),
        }
    }

    /// Write a chunk of output.
    ///
    /// The result is that of the fan-out (see [`BroadcastWriter::write`]);
    /// the scrollback is updated regardless.
    pub fn write(&self, data: &[u8]) -> LushResult<usize> {
        let closed = lock(&self.closed);
        if *closed {
            return Err(LushError::StreamClosed);
        }
        let res = self.broadcast.write(data);
        self.scrollback.write(data);
        res
    }

    /// Close every attached sink. Only the first call has any effect.
    pub fn close(&self) -> LushResult<()> {
        let mut closed = lock(&self.closed);
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.broadcast.close_all()?;
        Ok(())
    }

    /// Close and drop every sink, breaking links into the pipe graph.
    pub(crate) fn release(&self) -> LushResult<()> {
        let res = self.close();
        self.broadcast.clear();
        res
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    /// Attach `sink`. On a closed stream the sink is closed right away
    /// instead, so a late reader still sees end of input.
    pub fn add_sink(&self, sink: SharedSink) {
        let closed = lock(&self.closed);
        self.attach(*closed, sink);
    }

    fn attach(&self, closed: bool, sink: SharedSink) {
        if !closed {
            self.broadcast.add_sink(sink);
            return;
        }
        debug!(downstream = ?sink.target(), "sink attached to closed stream, closing it");
        if let Err(e) = sink.close() {
            warn!(error = %e, "error closing late sink");
        }
    }

    /// Detach every sink feeding the stdin of command `id`. Returns how many
    /// were removed.
    pub fn remove_target(&self, id: CmdId) -> usize {
        let mut removed = 0;
        for sink in self.broadcast.list_sinks() {
            if sink.target() == Some(id) && self.broadcast.remove_sink(&sink) {
                removed += 1;
            }
        }
        removed
    }

    /// Attach `sink` and return the scrollback as it stood at that moment.
    /// On a closed stream the sink is closed after the snapshot is taken.
    ///
    /// No write can slip in between the snapshot and the attach, so the
    /// returned history followed by what the sink receives is the exact
    /// output with no gap and no overlap.
    pub fn add_sink_with_scrollback(&self, sink: SharedSink) -> Vec<u8> {
        let closed = lock(&self.closed);
        let history = self.scrollback.snapshot();
        self.attach(*closed, sink);
        history
    }

    pub fn remove_sink(&self, sink: &SharedSink) -> bool {
        self.broadcast.remove_sink(sink)
    }

    pub fn list_sinks(&self) -> Vec<SharedSink> {
        self.broadcast.list_sinks()
    }

    /// Commands whose stdin currently receives this stream.
    pub fn downstream(&self) -> Vec<CmdId> {
        self.broadcast
            .list_sinks()
            .iter()
            .filter_map(|s| s.target())
            .collect()
    }

    pub fn scrollback(&self) -> Scrollback {
        self.scrollback.clone()
    }
}
