//! Command status: not started, running, exited.
//!
//! Transitions happen exactly once each, in order, and are pushed
//! synchronously to change listeners while the status lock is held. Once the
//! command has exited the listener list is emptied for good.

use crate::error::ExitError;
use crate::{lock, LushResult};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Four-way summary of a command's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

/// Point-in-time copy of a status, as passed to listeners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub started: Option<SystemTime>,
    pub exited: Option<SystemTime>,
    pub err: Option<ExitError>,
}

impl StatusSnapshot {
    pub fn state(&self) -> CommandState {
        match (self.started, self.exited, &self.err) {
            (_, Some(_), None) => CommandState::Succeeded,
            (_, Some(_), Some(_)) => CommandState::Failed,
            (Some(_), None, _) => CommandState::Running,
            (None, None, _) => CommandState::NotStarted,
        }
    }

    /// True while no error is recorded. Only conclusive once exited.
    pub fn success(&self) -> bool {
        self.err.is_none()
    }
}

type Listener = Box<dyn FnMut(&StatusSnapshot) -> LushResult<()> + Send>;

struct StatusInner {
    snap: StatusSnapshot,
    listeners: Vec<Listener>,
}

/// Status of one command, shared between the command and its observers.
pub struct CommandStatus {
    inner: Mutex<StatusInner>,
}

impl Default for CommandStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                snap: StatusSnapshot::default(),
                listeners: Vec::new(),
            }),
        }
    }

    /// When the process was started; `None` if it never ran.
    pub fn started(&self) -> Option<SystemTime> {
        lock(&self.inner).snap.started
    }

    /// When the command finished; `None` while not started or running.
    pub fn exited(&self) -> Option<SystemTime> {
        lock(&self.inner).snap.exited
    }

    pub fn success(&self) -> bool {
        lock(&self.inner).snap.success()
    }

    pub fn err(&self) -> Option<ExitError> {
        lock(&self.inner).snap.err.clone()
    }

    pub fn state(&self) -> CommandState {
        lock(&self.inner).snap.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CommandState::Running
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        lock(&self.inner).snap.clone()
    }

    /// Call `listener` on every future transition.
    ///
    /// A listener returning an error, or panicking, is dropped right after
    /// that call; the others are still notified.
    /// Listeners run under the status lock and must not call back into this
    /// status; everything they need is in the snapshot. Registering on an
    /// exited status is a no-op since no transition is left.
    pub fn notify_change<F>(&self, listener: F)
    where
        F: FnMut(&StatusSnapshot) -> LushResult<()> + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        if inner.snap.exited.is_some() {
            return;
        }
        inner.listeners.push(Box::new(listener));
    }

    /// Not started -> running.
    ///
    /// # Panics
    /// If the status already left the not-started state.
    pub(crate) fn start_now(&self) {
        let mut inner = lock(&self.inner);
        if inner.snap.started.is_some() || inner.snap.exited.is_some() {
            panic!("re-starting status not allowed");
        }
        inner.snap.started = Some(SystemTime::now());
        Self::changed(&mut inner);
    }

    /// Running (or never started) -> exited, with the outcome.
    ///
    /// # Panics
    /// If the status has already exited.
    pub(crate) fn exit_now(&self, err: Option<ExitError>) {
        let mut inner = lock(&self.inner);
        if inner.snap.exited.is_some() {
            panic!("status can only be exited once");
        }
        inner.snap.err = err;
        inner.snap.exited = Some(SystemTime::now());
        Self::changed(&mut inner);
    }

    fn changed(inner: &mut StatusInner) {
        let snap = inner.snap.clone();
        debug!(state = ?snap.state(), listeners = inner.listeners.len(), "status changed");
        inner.listeners.retain_mut(|listener| {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(&snap))) {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!(error = %e, "status listener unsubscribed");
                    false
                }
                Err(_) => {
                    warn!("status listener panicked, unsubscribed");
                    false
                }
            }
        });
        if snap.exited.is_some() {
            inner.listeners = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LushError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter(status: &CommandStatus) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        status.notify_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        calls
    }

    #[test]
    fn lifecycle_states() {
        let status = CommandStatus::new();
        assert_eq!(status.state(), CommandState::NotStarted);
        assert!(status.started().is_none());

        status.start_now();
        assert_eq!(status.state(), CommandState::Running);
        assert!(status.is_running());

        status.exit_now(None);
        assert_eq!(status.state(), CommandState::Succeeded);
        assert!(status.success());
        assert!(status.exited().is_some());
    }

    #[test]
    fn listener_sees_each_transition_once_in_order() {
        let status = CommandStatus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        status.notify_change(move |snap| {
            lock(&s).push(snap.state());
            Ok(())
        });
        status.start_now();
        status.exit_now(Some(ExitError::Code(3)));
        assert_eq!(
            *lock(&seen),
            vec![CommandState::Running, CommandState::Failed]
        );
    }

    #[test]
    fn failing_listener_is_never_called_again() {
        let status = CommandStatus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        status.notify_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Err(LushError::Other("gone".into()))
        });
        let steady = counter(&status);

        status.start_now();
        status.exit_now(None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(steady.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_notifications_after_exit() {
        let status = CommandStatus::new();
        status.start_now();
        status.exit_now(None);
        let late = counter(&status);
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert!(lock(&status.inner).listeners.is_empty());
    }

    #[test]
    fn launch_failure_is_a_single_transition() {
        let status = CommandStatus::new();
        let calls = counter(&status);
        status.exit_now(Some(ExitError::Code(127)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(status.started().is_none());
        assert_eq!(status.state(), CommandState::Failed);
        assert_eq!(status.err(), Some(ExitError::Code(127)));
    }

    #[test]
    fn panicking_listener_is_dropped_and_others_still_run() {
        let status = CommandStatus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        status.notify_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            panic!("listener blew up");
        });
        let steady = counter(&status);

        status.start_now();
        status.exit_now(None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(steady.load(Ordering::SeqCst), 2);
        assert_eq!(status.state(), CommandState::Succeeded);
    }

    #[test]
    #[should_panic(expected = "re-starting status not allowed")]
    fn double_start_panics() {
        let status = CommandStatus::new();
        status.start_now();
        status.start_now();
    }

    #[test]
    fn readers_do_not_race_transitions() {
        let status = Arc::new(CommandStatus::new());
        let reader = {
            let status = status.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let snap = status.snapshot();
                    if snap.exited.is_some() {
                        assert!(snap.started.is_some());
                    }
                }
            })
        };
        status.start_now();
        status.exit_now(None);
        reader.join().unwrap();
    }
}
