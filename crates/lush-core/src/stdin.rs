//! Input stream of a command.
//!
//! The OS pipe behind it is opened on the first write or at start, whichever
//! comes first, so data written before the command starts waits in the pipe
//! until the process reads it. A write that does not fit in the pipe blocks
//! until then.

use crate::command::{Command, CommandInner};
use crate::sink::Sink;
use crate::status::CommandStatus;
use crate::{lock, CmdId, LushError, LushResult};
use std::io::{self, PipeReader, PipeWriter, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};

enum WriteEnd {
    Unopened,
    Open(Arc<PipeWriter>),
    Closed,
}

struct PipeEnds {
    writer: WriteEnd,
    /// Read end, handed to the child at start.
    reader: Option<PipeReader>,
}

impl PipeEnds {
    fn open(&mut self) -> io::Result<Arc<PipeWriter>> {
        let (reader, writer) = std::io::pipe()?;
        let writer = Arc::new(writer);
        self.reader = Some(reader);
        self.writer = WriteEnd::Open(writer.clone());
        Ok(writer)
    }
}

/// Write handle bound to one command's stdin.
///
/// Also a [`Sink`], which is how one command's output is piped into another.
pub struct InStream {
    id: CmdId,
    cmd: Weak<CommandInner>,
    status: Arc<CommandStatus>,
    ends: Mutex<PipeEnds>,
}

impl InStream {
    pub(crate) fn new(id: CmdId, cmd: Weak<CommandInner>, status: Arc<CommandStatus>) -> Self {
        Self {
            id,
            cmd,
            status,
            ends: Mutex::new(PipeEnds {
                writer: WriteEnd::Unopened,
                reader: None,
            }),
        }
    }

    /// Id of the owning command.
    pub fn id(&self) -> CmdId {
        self.id
    }

    /// The owning command.
    ///
    /// Only a weak reference is kept, so this is `None` once every
    /// `Command` handle is gone. A command registered in a `Session` stays
    /// reachable until it is released from it.
    pub fn cmd(&self) -> Option<Command> {
        self.cmd.upgrade().map(Command::from_inner)
    }

    /// Write all of `data` to the command's stdin.
    ///
    /// Fails once the command has exited or the stream was closed.
    pub fn write(&self, data: &[u8]) -> LushResult<usize> {
        if self.status.exited().is_some() {
            return Err(LushError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("command {} has exited", self.id),
            )));
        }
        let writer = {
            let mut ends = lock(&self.ends);
            let open = match &ends.writer {
                WriteEnd::Closed => return Err(LushError::StreamClosed),
                WriteEnd::Open(w) => Some(w.clone()),
                WriteEnd::Unopened => None,
            };
            match open {
                Some(w) => w,
                None => ends.open()?,
            }
        };
        // The lock is not held here: a full pipe must not stall start().
        (&*writer).write_all(data)?;
        Ok(data.len())
    }

    /// Signal end of input. Later writes fail.
    pub fn close(&self) -> LushResult<()> {
        lock(&self.ends).writer = WriteEnd::Closed;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        matches!(lock(&self.ends).writer, WriteEnd::Closed)
    }

    /// Stdio for the child: the read end of the pipe, opening it if needed.
    pub(crate) fn take_stdio(&self) -> io::Result<Stdio> {
        let mut ends = lock(&self.ends);
        if let WriteEnd::Unopened = ends.writer {
            ends.open()?;
        }
        match ends.reader.take() {
            Some(reader) => Ok(Stdio::from(reader)),
            // Closed before anything was written: nothing to read.
            None if matches!(ends.writer, WriteEnd::Closed) => Ok(Stdio::null()),
            None => Err(io::Error::other("stdin already handed to a process")),
        }
    }

    /// Drop both pipe ends.
    pub(crate) fn release(&self) {
        let mut ends = lock(&self.ends);
        ends.writer = WriteEnd::Closed;
        ends.reader = None;
    }
}

impl Sink for InStream {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        InStream::write(self, data).map_err(io::Error::from)
    }

    fn close(&self) -> io::Result<()> {
        InStream::close(self).map_err(io::Error::from)
    }

    fn target(&self) -> Option<CmdId> {
        Some(self.id)
    }
}
