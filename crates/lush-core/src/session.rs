//! Session: the registry of commands plus the environment they inherit.
//!
//! Environment variables and the working directory are session-local and
//! only affect commands created after the change; each command captures a
//! copy when it is created.

use crate::command::{Command, CommandInfo, StreamKind};
use crate::config::SessionConfig;
use crate::{CmdId, LushError, LushResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

pub struct Session {
    next_id: AtomicU64,
    commands: RwLock<HashMap<CmdId, Command>>,
    env: RwLock<HashMap<String, String>>,
    cwd: RwLock<PathBuf>,
    config: SessionConfig,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let env = if config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        let cwd = config
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));
        debug!(cwd = %cwd.display(), vars = env.len(), "session created");
        Self {
            next_id: AtomicU64::new(1),
            commands: RwLock::new(HashMap::new()),
            env: RwLock::new(env),
            cwd: RwLock::new(cwd),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create and register a command running `name` with `args`.
    ///
    /// The command gets a fresh id and a snapshot of the session's current
    /// environment and working directory. Nothing runs until it is started.
    pub fn new_command<I, S>(&self, name: impl Into<String>, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = CmdId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let argv: Vec<String> = std::iter::once(name.into())
            .chain(args.into_iter().map(Into::into))
            .collect();
        let env = read(&self.env).clone();
        let cwd = read(&self.cwd).clone();
        debug!(id = %id, argv = ?argv, "new command");
        let cmd = Command::new(id, argv, env, cwd, &self.config);
        write(&self.commands).insert(id, cmd.clone());
        cmd
    }

    pub fn get_command(&self, id: CmdId) -> Option<Command> {
        read(&self.commands).get(&id).cloned()
    }

    /// Ids of all registered commands, in no particular order.
    pub fn get_command_ids(&self) -> Vec<CmdId> {
        read(&self.commands).keys().copied().collect()
    }

    /// Release a command's resources and forget it.
    ///
    /// Fails for an unknown id or a running command; the latter stays
    /// registered. Any other release error is returned after the command
    /// has been removed. Pipe edges from other commands into its stdin are
    /// removed as well.
    pub fn release_command(&self, id: CmdId) -> LushResult<()> {
        let cmd = self
            .get_command(id)
            .ok_or(LushError::CommandNotFound(id))?;
        let res = cmd.release();
        if matches!(res, Err(LushError::StillRunning)) {
            return res;
        }
        write(&self.commands).remove(&id);
        self.unlink(id);
        if let Err(e) = &res {
            warn!(id = %id, error = %e, "command released with errors");
        }
        res
    }

    /// Drop every pipe edge that feeds the stdin of command `id`.
    fn unlink(&self, id: CmdId) {
        let cmds: Vec<Command> = read(&self.commands).values().cloned().collect();
        let removed: usize = cmds
            .iter()
            .map(|c| c.stdout().remove_target(id) + c.stderr().remove_target(id))
            .sum();
        if removed > 0 {
            debug!(id = %id, edges = removed, "unlinked released command");
        }
    }

    /// Feed `from`'s `kind` output into `to`'s stdin, both by id.
    pub fn connect(&self, from: CmdId, kind: StreamKind, to: CmdId) -> LushResult<()> {
        let src = self
            .get_command(from)
            .ok_or(LushError::CommandNotFound(from))?;
        let dst = self.get_command(to).ok_or(LushError::CommandNotFound(to))?;
        src.pipe_to(kind, &dst);
        info!(from = %from, to = %to, stream = ?kind, "commands connected");
        Ok(())
    }

    /// Snapshot of every registered command, ordered by id.
    pub fn command_infos(&self) -> Vec<CommandInfo> {
        let mut cmds: Vec<Command> = read(&self.commands).values().cloned().collect();
        cmds.sort_by_key(Command::id);
        cmds.iter().map(Command::info).collect()
    }

    pub fn len(&self) -> usize {
        read(&self.commands).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.commands).is_empty()
    }

    /// Change the working directory for commands created from now on.
    pub fn chdir(&self, dir: impl AsRef<Path>) -> LushResult<()> {
        let mut cwd = write(&self.cwd);
        let target = cwd.join(dir.as_ref());
        if !target.is_dir() {
            return Err(LushError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("not a directory: {}", target.display()),
            )));
        }
        *cwd = target.canonicalize()?;
        debug!(cwd = %cwd.display(), "session cwd changed");
        Ok(())
    }

    pub fn cwd(&self) -> PathBuf {
        read(&self.cwd).clone()
    }

    pub fn setenv(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        debug!(key = %key, "setenv");
        write(&self.env).insert(key, value.into());
    }

    pub fn unsetenv(&self, key: &str) {
        debug!(key = %key, "unsetenv");
        write(&self.env).remove(key);
    }

    pub fn getenv(&self, key: &str) -> Option<String> {
        read(&self.env).get(key).cloned()
    }

    /// Copy of the session environment.
    pub fn environ(&self) -> HashMap<String, String> {
        read(&self.env).clone()
    }
}
