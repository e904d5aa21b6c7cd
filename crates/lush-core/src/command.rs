//! A single external command and the OS process behind it.
//!
//! A [`Command`] is created by a [`Session`](crate::Session), can be wired to
//! other commands before or after it starts, runs at most once, and must be
//! released explicitly to give back its pipes.
//!
//! Starting spawns the process and one supervisor thread. The supervisor
//! pumps stdout (a helper thread pumps stderr), reaps the child, closes both
//! output streams, records the outcome in the status and wakes up waiters.

use crate::config::SessionConfig;
use crate::error::ExitError;
use crate::sink::{discard, SharedSink};
use crate::status::{CommandState, CommandStatus};
use crate::stdin::InStream;
use crate::stream::OutStream;
use crate::{lock, CmdId, LushError, LushResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Which output stream of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Serializable snapshot of a command, for display layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub id: CmdId,
    pub name: String,
    pub argv: Vec<String>,
    pub state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Commands whose stdin is fed by this command's stdout.
    #[serde(default)]
    pub stdout_to: Vec<CmdId>,
    #[serde(default)]
    pub stderr_to: Vec<CmdId>,
    pub stdout_scrollback: usize,
    pub stderr_scrollback: usize,
}

/// What to run. Frozen once the command starts.
#[derive(Debug, Clone)]
struct Invocation {
    argv: Vec<String>,
    name: Option<String>,
    env: HashMap<String, String>,
    cwd: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepared,
    Started,
    Released,
}

/// One-shot completion signal.
struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        *lock(&self.done) = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

pub(crate) struct CommandInner {
    id: CmdId,
    inv: Mutex<Invocation>,
    phase: Mutex<Phase>,
    /// Set while the process is alive and not yet reaped.
    pid: Mutex<Option<u32>>,
    stdin: Arc<InStream>,
    stdout: Arc<OutStream>,
    stderr: Arc<OutStream>,
    status: Arc<CommandStatus>,
    done: Completion,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    pump_stack_size: usize,
    read_chunk: usize,
}

/// Handle to a command. Clones refer to the same command.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.inner.id)
            .field("argv", &lock(&self.inner.inv).argv)
            .field("state", &self.inner.status.state())
            .finish()
    }
}

impl Command {
    /// Build a command. `argv` must not be empty.
    pub(crate) fn new(
        id: CmdId,
        argv: Vec<String>,
        env: HashMap<String, String>,
        cwd: PathBuf,
        config: &SessionConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let status = Arc::new(CommandStatus::new());
            CommandInner {
                id,
                inv: Mutex::new(Invocation {
                    argv,
                    name: None,
                    env,
                    cwd,
                }),
                phase: Mutex::new(Phase::Prepared),
                pid: Mutex::new(None),
                stdin: Arc::new(InStream::new(id, weak.clone(), status.clone())),
                stdout: Arc::new(OutStream::new(config.stdout_scrollback)),
                stderr: Arc::new(OutStream::new(config.stderr_scrollback)),
                status,
                done: Completion::new(),
                user_data: Mutex::new(None),
                pump_stack_size: config.pump_stack_size,
                read_chunk: config.read_chunk.max(1),
            }
        });
        inner.stdout.add_sink(discard());
        inner.stderr.add_sink(discard());
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<CommandInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> CmdId {
        self.inner.id
    }

    /// The name set with [`set_name`](Self::set_name), else `argv[0]`.
    pub fn name(&self) -> String {
        let inv = lock(&self.inner.inv);
        inv.name.clone().unwrap_or_else(|| inv.argv[0].clone())
    }

    pub fn set_name(&self, name: impl Into<String>) -> LushResult<()> {
        self.ensure_prepared()?;
        lock(&self.inner.inv).name = Some(name.into());
        Ok(())
    }

    pub fn argv(&self) -> Vec<String> {
        lock(&self.inner.inv).argv.clone()
    }

    pub fn set_argv(&self, argv: Vec<String>) -> LushResult<()> {
        if argv.is_empty() {
            return Err(LushError::EmptyArgv);
        }
        self.ensure_prepared()?;
        lock(&self.inner.inv).argv = argv;
        Ok(())
    }

    /// Environment captured when the command was created.
    pub fn environ(&self) -> HashMap<String, String> {
        lock(&self.inner.inv).env.clone()
    }

    /// Working directory captured when the command was created.
    pub fn cwd(&self) -> PathBuf {
        lock(&self.inner.inv).cwd.clone()
    }

    fn ensure_prepared(&self) -> LushResult<()> {
        match *lock(&self.inner.phase) {
            Phase::Prepared => Ok(()),
            Phase::Started => Err(LushError::AlreadyStarted),
            Phase::Released => Err(LushError::Released),
        }
    }

    pub fn stdin(&self) -> Arc<InStream> {
        self.inner.stdin.clone()
    }

    pub fn stdout(&self) -> Arc<OutStream> {
        self.inner.stdout.clone()
    }

    pub fn stderr(&self) -> Arc<OutStream> {
        self.inner.stderr.clone()
    }

    pub fn stream(&self, kind: StreamKind) -> Arc<OutStream> {
        match kind {
            StreamKind::Stdout => self.stdout(),
            StreamKind::Stderr => self.stderr(),
        }
    }

    pub fn status(&self) -> Arc<CommandStatus> {
        self.inner.status.clone()
    }

    /// Feed this command's `kind` output into `to`'s stdin.
    ///
    /// Works before or after either command has started. Cycles are allowed.
    pub fn pipe_to(&self, kind: StreamKind, to: &Command) {
        let sink: SharedSink = to.stdin();
        self.stream(kind).add_sink(sink);
    }

    /// Undo [`pipe_to`](Self::pipe_to). Returns false if not connected.
    pub fn unpipe(&self, kind: StreamKind, to: &Command) -> bool {
        let sink: SharedSink = to.stdin();
        self.stream(kind).remove_sink(&sink)
    }

    /// Opaque value attached by the caller. Never inspected here.
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        lock(&self.inner.user_data).clone()
    }

    pub fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *lock(&self.inner.user_data) = Some(Arc::new(data));
    }

    pub fn user_data_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data()?.downcast::<T>().ok()
    }

    pub fn clear_user_data(&self) {
        *lock(&self.inner.user_data) = None;
    }

    /// Start the process in the background.
    ///
    /// Fails if the command was already started or released. If the process
    /// cannot be spawned the status goes straight to exited with
    /// [`ExitError::Launch`] (it never reports started) and that error is
    /// returned.
    pub fn start(&self) -> LushResult<()> {
        {
            let mut phase = lock(&self.inner.phase);
            match *phase {
                Phase::Prepared => *phase = Phase::Started,
                Phase::Started => return Err(LushError::AlreadyStarted),
                Phase::Released => return Err(LushError::Released),
            }
        }

        let inv = lock(&self.inner.inv).clone();
        let program = resolve_program(&inv);

        let mut builder = std::process::Command::new(&program);
        builder
            .args(&inv.argv[1..])
            .env_clear()
            .envs(&inv.env)
            .current_dir(&inv.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            builder.arg0(&inv.argv[0]);
        }
        match self.inner.stdin.take_stdio() {
            Ok(stdin) => {
                builder.stdin(stdin);
            }
            Err(e) => return Err(self.fail_launch(&inv.argv[0], &e)),
        }

        let spawned = builder.spawn();
        // Dropping the builder closes our copy of the child's stdin read end.
        drop(builder);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return Err(self.fail_launch(&inv.argv[0], &e)),
        };

        let pid = child.id();
        *lock(&self.inner.pid) = Some(pid);
        self.inner.status.start_now();
        info!(id = %self.inner.id, program = %program.display(), pid, "command started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let inner = self.inner.clone();
        let supervisor = thread::Builder::new()
            .name(format!("lush-cmd-{}", self.inner.id))
            .stack_size(self.inner.pump_stack_size)
            .spawn(move || supervise(inner, child, stdout, stderr));
        if let Err(e) = supervisor {
            // Nobody will reap the child; take it down and report.
            warn!(id = %self.inner.id, error = %e, "failed to spawn supervisor thread");
            let _ = send_signal(pid, KILL_SIGNAL);
            *lock(&self.inner.pid) = None;
            self.finish(Some(ExitError::Wait(e.to_string())));
            return Err(LushError::Io(e));
        }
        Ok(())
    }

    fn fail_launch(&self, program: &str, e: &io::Error) -> LushError {
        let err = ExitError::launch(program, e);
        warn!(id = %self.inner.id, error = %err, "command failed to launch");
        self.finish(Some(err.clone()));
        LushError::Exit(err)
    }

    /// Close the output streams, record the outcome and wake up waiters.
    fn finish(&self, err: Option<ExitError>) {
        finish(&self.inner, err);
    }

    /// Block until the command has finished.
    ///
    /// Returns the command's exit error, if any. Fails with
    /// [`LushError::NotStarted`] if [`start`](Self::start) was never called.
    pub fn wait(&self) -> LushResult<()> {
        match *lock(&self.inner.phase) {
            Phase::Prepared => return Err(LushError::NotStarted),
            Phase::Released if self.inner.status.exited().is_none() => {
                return Err(LushError::Released)
            }
            _ => {}
        }
        self.inner.done.wait();
        match self.inner.status.err() {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Start, then wait.
    pub fn run(&self) -> LushResult<()> {
        self.start()?;
        self.wait()
    }

    /// Send a raw signal number (e.g. `libc::SIGTERM`) to the process.
    ///
    /// Only valid while running. The check and the delivery happen under the
    /// process lock, but the process may still exit on its own between the
    /// two, so delivery is best-effort rather than guaranteed.
    pub fn signal(&self, sig: i32) -> LushResult<()> {
        let pid = lock(&self.inner.pid);
        let Some(pid) = *pid else {
            return Err(LushError::NotRunning);
        };
        debug!(id = %self.inner.id, pid, sig, "sending signal");
        send_signal(pid, sig)
    }

    /// Give back every OS resource held by this command.
    ///
    /// Refused while running. Closes stdin and both output streams (dropping
    /// all of their sinks); the first error is returned but every resource is
    /// released regardless. A released command can't be started.
    pub fn release(&self) -> LushResult<()> {
        {
            let mut phase = lock(&self.inner.phase);
            match *phase {
                Phase::Released => return Err(LushError::Released),
                Phase::Started if self.inner.status.exited().is_none() => {
                    return Err(LushError::StillRunning)
                }
                _ => *phase = Phase::Released,
            }
        }

        self.inner.stdin.release();
        let mut first = Ok(());
        for stream in [&self.inner.stdout, &self.inner.stderr] {
            if let Err(e) = stream.release() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        *lock(&self.inner.pid) = None;
        info!(id = %self.inner.id, "command released");
        first
    }

    pub fn info(&self) -> CommandInfo {
        let (name, argv) = {
            let inv = lock(&self.inner.inv);
            let name = inv.name.clone().unwrap_or_else(|| inv.argv[0].clone());
            (name, inv.argv.clone())
        };
        let status = self.inner.status.snapshot();
        CommandInfo {
            id: self.inner.id,
            name,
            argv,
            state: status.state(),
            error: status.err.map(|e| e.to_string()),
            stdout_to: self.inner.stdout.downstream(),
            stderr_to: self.inner.stderr.downstream(),
            stdout_scrollback: self.inner.stdout.scrollback().size(),
            stderr_scrollback: self.inner.stderr.scrollback().size(),
        }
    }
}

/// Find the executable on the command's own `PATH`, falling back to the
/// literal name so a missing binary surfaces as the spawn error.
fn resolve_program(inv: &Invocation) -> PathBuf {
    let name = &inv.argv[0];
    let paths = inv
        .env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok());
    which::which_in(name, paths, &inv.cwd).unwrap_or_else(|_| PathBuf::from(name))
}

fn supervise(
    inner: Arc<CommandInner>,
    mut child: Child,
    stdout: Option<impl Read + Send + 'static>,
    stderr: Option<impl Read + Send + 'static>,
) {
    let id = inner.id;
    let chunk = inner.read_chunk;

    let stderr_pump = stderr.and_then(|reader| {
        let stream = inner.stderr.clone();
        thread::Builder::new()
            .name(format!("lush-cmd-{id}-stderr"))
            .stack_size(inner.pump_stack_size)
            .spawn(move || pump(reader, &stream, chunk))
            .map_err(|e| warn!(id = %id, error = %e, "failed to spawn stderr pump"))
            .ok()
    });
    let stdout_res = match stdout {
        Some(reader) => pump(reader, &inner.stdout, chunk),
        None => Ok(()),
    };
    let stderr_res = match stderr_pump {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(LushError::Other("stderr pump panicked".into()))),
        None => Ok(()),
    };

    let waited = child.wait();
    *lock(&inner.pid) = None;

    let err = match waited {
        Ok(status) => exit_error(status)
            .or_else(|| stdout_res.err().map(|e| ExitError::Stream(e.to_string())))
            .or_else(|| stderr_res.err().map(|e| ExitError::Stream(e.to_string()))),
        Err(e) => Some(ExitError::Wait(e.to_string())),
    };
    debug!(id = %id, error = ?err, "command exited");
    finish(&inner, err);
}

/// Copy a child's output into `stream` until EOF or until the stream stops
/// accepting data. Returning drops the reader, so the child sees a broken
/// pipe if it keeps writing.
fn pump<R: Read>(mut reader: R, stream: &OutStream, chunk: usize) -> LushResult<()> {
    let mut buf = vec![0u8; chunk];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = stream.write(&buf[..n]) {
            warn!(error = %e, "output stream rejected data, stopping pump");
            return Err(e);
        }
    }
}

/// Releases waiters when dropped, even if recording the outcome unwinds.
struct SignalOnDrop<'a>(&'a Completion);

impl Drop for SignalOnDrop<'_> {
    fn drop(&mut self) {
        self.0.signal();
    }
}

fn finish(inner: &CommandInner, err: Option<ExitError>) {
    let _done = SignalOnDrop(&inner.done);
    for stream in [&inner.stdout, &inner.stderr] {
        if let Err(e) = stream.close() {
            warn!(id = %inner.id, error = %e, "error closing output stream");
        }
    }
    inner.status.exit_now(err);
}

fn exit_error(status: ExitStatus) -> Option<ExitError> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(ExitError::Code(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Some(ExitError::Signal(sig));
        }
    }
    Some(ExitError::Code(-1))
}

#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

#[cfg(unix)]
fn send_signal(pid: u32, sig: i32) -> LushResult<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| LushError::Other(format!("pid {pid} out of range")))?;
    // SAFETY: kill(2) takes plain integers and has no memory effects.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _sig: i32) -> LushResult<()> {
    Err(LushError::Other("signals are only supported on unix".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(argv: &[&str]) -> Command {
        Command::new(
            CmdId(1),
            argv.iter().map(|s| s.to_string()).collect(),
            std::env::vars().collect(),
            std::env::current_dir().unwrap(),
            &SessionConfig::default(),
        )
    }

    #[test]
    fn name_defaults_to_argv0() {
        let c = command(&["echo", "hi"]);
        assert_eq!(c.name(), "echo");
        c.set_name("greeter").unwrap();
        assert_eq!(c.name(), "greeter");
        assert_eq!(c.argv(), vec!["echo", "hi"]);
    }

    #[test]
    fn empty_argv_rejected() {
        let c = command(&["echo"]);
        assert!(matches!(c.set_argv(Vec::new()), Err(LushError::EmptyArgv)));
        assert_eq!(c.argv(), vec!["echo"]);
    }

    #[test]
    fn usage_errors_before_start() {
        let c = command(&["echo"]);
        assert!(matches!(c.wait(), Err(LushError::NotStarted)));
        assert!(matches!(c.signal(15), Err(LushError::NotRunning)));
    }

    #[test]
    fn new_command_discards_output_by_default() {
        let c = command(&["echo"]);
        assert_eq!(c.stdout().list_sinks().len(), 1);
        assert_eq!(c.stderr().list_sinks().len(), 1);
        assert_eq!(c.stdout().scrollback().size(), 1000);
    }

    #[test]
    fn user_data_is_opaque() {
        let c = command(&["echo"]);
        assert!(c.user_data().is_none());
        c.set_user_data(String::from("tab 3"));
        assert_eq!(c.user_data_as::<String>().unwrap().as_str(), "tab 3");
        assert!(c.user_data_as::<u32>().is_none());
        c.clear_user_data();
        assert!(c.user_data().is_none());
    }

    #[test]
    fn pipe_graph_shows_up_in_info() {
        let a = command(&["echo"]);
        let b = Command::new(
            CmdId(2),
            vec!["cat".into()],
            HashMap::new(),
            PathBuf::from("/"),
            &SessionConfig::default(),
        );
        a.pipe_to(StreamKind::Stdout, &b);
        a.pipe_to(StreamKind::Stderr, &b);
        let info = a.info();
        assert_eq!(info.stdout_to, vec![CmdId(2)]);
        assert_eq!(info.stderr_to, vec![CmdId(2)]);
        assert_eq!(info.state, CommandState::NotStarted);

        assert!(a.unpipe(StreamKind::Stderr, &b));
        assert!(!a.unpipe(StreamKind::Stderr, &b));
        assert!(a.info().stderr_to.is_empty());

        let json = serde_json::to_value(&a.info()).unwrap();
        assert_eq!(json["state"], "not_started");
        assert_eq!(json["stdout_to"][0], 2);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn stdin_points_back_to_command() {
        let c = command(&["cat"]);
        let stdin = c.stdin();
        assert_eq!(stdin.cmd().unwrap().id(), c.id());
    }

    #[test]
    fn release_unstarted_then_reject_everything() {
        let c = command(&["echo"]);
        c.release().unwrap();
        assert!(c.stdout().is_closed());
        assert!(c.stdout().list_sinks().is_empty());
        assert!(matches!(c.release(), Err(LushError::Released)));
        assert!(matches!(c.start(), Err(LushError::Released)));
        assert!(matches!(c.wait(), Err(LushError::Released)));
        assert!(matches!(c.set_argv(vec!["ls".into()]), Err(LushError::Released)));
    }
}
