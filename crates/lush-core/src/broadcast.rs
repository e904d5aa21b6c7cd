//! Fan-out writer with self-pruning sinks.
//!
//! Every write goes to every registered sink, serially and in insertion
//! order. A sink whose write fails is dropped on the spot and the failure is
//! not reported to the writer. One slow sink therefore stalls the whole
//! write; callers that attach consumers of unknown speed should put a
//! buffered sink such as [`ChannelSink`](crate::ChannelSink) in between.

use crate::sink::{same_sink, SharedSink};
use crate::{lock, LushError, LushResult};
use std::io;
use std::sync::Mutex;
use tracing::warn;

#[derive(Default)]
pub struct BroadcastWriter {
    sinks: Mutex<Vec<SharedSink>>,
}

impl BroadcastWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: SharedSink) {
        lock(&self.sinks).push(sink);
    }

    /// Remove a previously added sink. Returns false if it was not attached.
    pub fn remove_sink(&self, sink: &SharedSink) -> bool {
        let mut sinks = lock(&self.sinks);
        match sinks.iter().position(|s| same_sink(s, sink)) {
            Some(i) => {
                sinks.remove(i);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the current sinks.
    pub fn list_sinks(&self) -> Vec<SharedSink> {
        lock(&self.sinks).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sinks).is_empty()
    }

    /// Write `data` to every sink, dropping the ones that fail.
    ///
    /// Reports `data.len()` as long as at least one sink was attached when
    /// the write began, even if all of them failed. With no sinks at all
    /// nothing is written and [`LushError::NoSink`] is returned.
    pub fn write(&self, data: &[u8]) -> LushResult<usize> {
        let mut sinks = lock(&self.sinks);
        if sinks.is_empty() {
            return Err(LushError::NoSink);
        }
        sinks.retain(|sink| match sink.write(data) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, downstream = ?sink.target(), "dropping failed sink");
                false
            }
        });
        Ok(data.len())
    }

    /// Close every sink, returning the first error but closing them all.
    pub fn close_all(&self) -> io::Result<()> {
        let sinks = lock(&self.sinks);
        let mut first = Ok(());
        for sink in sinks.iter() {
            if let Err(e) = sink.close() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    /// Detach every sink.
    pub fn clear(&self) {
        lock(&self.sinks).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CaptureSink, Sink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Accepts `limit` writes, then fails forever.
    struct FlakySink {
        left: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FlakySink {
        fn new(limit: usize) -> Self {
            Self {
                left: AtomicUsize::new(limit),
                closed: AtomicUsize::new(0),
            }
        }
    }

    impl Sink for FlakySink {
        fn write(&self, data: &[u8]) -> io::Result<usize> {
            let left = self.left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "flaky"));
            }
            self.left.store(left - 1, Ordering::SeqCst);
            Ok(data.len())
        }

        fn close(&self) -> io::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("close failed"))
        }
    }

    #[test]
    fn write_without_sinks_fails() {
        let bw = BroadcastWriter::new();
        assert!(matches!(bw.write(b"void"), Err(LushError::NoSink)));
    }

    #[test]
    fn failing_sink_is_pruned_silently() {
        let bw = BroadcastWriter::new();
        let good = CaptureSink::new();
        bw.add_sink(Arc::new(good.clone()));
        bw.add_sink(Arc::new(FlakySink::new(0)));

        assert_eq!(bw.write(b"data").unwrap(), 4);
        assert_eq!(bw.len(), 1);
        assert_eq!(good.contents(), b"data");
    }

    #[test]
    fn all_sinks_failing_still_reports_success_once() {
        let bw = BroadcastWriter::new();
        bw.add_sink(Arc::new(FlakySink::new(1)));
        assert_eq!(bw.write(b"a").unwrap(), 1);
        assert_eq!(bw.write(b"b").unwrap(), 1);
        assert!(bw.is_empty());
        assert!(matches!(bw.write(b"c"), Err(LushError::NoSink)));
    }

    #[test]
    fn remove_by_identity() {
        let bw = BroadcastWriter::new();
        let a: SharedSink = Arc::new(CaptureSink::new());
        let b: SharedSink = Arc::new(CaptureSink::new());
        bw.add_sink(a.clone());
        bw.add_sink(b.clone());

        assert!(bw.remove_sink(&a));
        assert!(!bw.remove_sink(&a));
        let left = bw.list_sinks();
        assert_eq!(left.len(), 1);
        assert!(same_sink(&left[0], &b));
    }

    #[test]
    fn list_is_a_copy() {
        let bw = BroadcastWriter::new();
        bw.add_sink(Arc::new(CaptureSink::new()));
        let listed = bw.list_sinks();
        bw.clear();
        assert_eq!(listed.len(), 1);
        assert!(bw.is_empty());
    }

    #[test]
    fn close_all_reports_first_error_and_closes_everything() {
        let bw = BroadcastWriter::new();
        let one = Arc::new(FlakySink::new(0));
        let two = Arc::new(FlakySink::new(0));
        bw.add_sink(one.clone());
        bw.add_sink(two.clone());
        assert!(bw.close_all().is_err());
        assert_eq!(one.closed.load(Ordering::SeqCst), 1);
        assert_eq!(two.closed.load(Ordering::SeqCst), 1);
    }
}
