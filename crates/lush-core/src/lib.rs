//! lush-core: process orchestration for the lush shell.
//!
//! Models external commands as long-lived observable objects whose standard
//! streams can be wired into arbitrary pipe graphs, with live fan-out to any
//! number of sinks, resizable scrollback, and status change notification.

pub mod broadcast;
pub mod command;
pub mod config;
pub mod error;
pub mod ring_buffer;
pub mod session;
pub mod sink;
pub mod status;
pub mod stdin;
pub mod stream;

// Re-export commonly used items at crate root.
pub use broadcast::BroadcastWriter;
pub use command::{Command, CommandInfo, StreamKind};
pub use config::SessionConfig;
pub use error::{ExitError, LushError, LushResult};
pub use ring_buffer::{RingBuffer, Scrollback};
pub use session::Session;
pub use sink::{discard, CaptureSink, ChannelSink, Discard, PrefixedSink, SharedSink, Sink, WriterSink};
pub use status::{CommandState, CommandStatus, StatusSnapshot};
pub use stdin::InStream;
pub use stream::OutStream;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// Identifier of a command within a session.
///
/// Unique among the commands currently registered; a released command's id
/// is never handed out again by the same session, but ids are not globally
/// unique across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CmdId(pub u64);

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CmdId {
    type Err = LushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(CmdId)
            .map_err(|e| LushError::Other(format!("invalid command id {s:?}: {e}")))
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
