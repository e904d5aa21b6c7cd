//! Build a linear pipeline in a session and map its outcome to an exit code.

use anyhow::{bail, Result};
use lush_core::{Command, ExitError, LushError, Session, StreamKind};
use std::io;
use tracing::warn;

/// Split each `-c` argument on whitespace and chain the commands
/// stdout -> stdin, in order.
pub fn build(session: &Session, lines: &[String]) -> Result<Vec<Command>> {
    let mut cmds: Vec<Command> = Vec::with_capacity(lines.len());
    for line in lines {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            bail!("empty command in pipeline");
        };
        let cmd = session.new_command(name, words);
        if let Some(prev) = cmds.last() {
            prev.pipe_to(StreamKind::Stdout, &cmd);
        }
        cmds.push(cmd);
    }
    Ok(cmds)
}

/// Start every command, last first so readers exist before writers.
///
/// A command that fails to launch is reported and left in its failed state;
/// the rest of the pipeline still runs.
pub fn start_all(cmds: &[Command]) {
    for cmd in cmds.iter().rev() {
        if let Err(e) = cmd.start() {
            warn!(id = %cmd.id(), error = %e, "command did not start");
            eprintln!("lush: {}: {e}", cmd.name());
        }
    }
}

/// Wait for every command; true if all of them succeeded.
pub fn wait_all(cmds: &[Command]) -> bool {
    let mut ok = true;
    for cmd in cmds {
        if let Err(e) = cmd.wait() {
            if !matches!(e, LushError::Exit(_)) {
                warn!(id = %cmd.id(), error = %e, "wait failed");
            }
            ok = false;
        }
    }
    ok
}

/// Shell-style exit code for a command's outcome.
pub fn exit_code(err: Option<&ExitError>) -> i32 {
    match err {
        None => 0,
        Some(ExitError::Code(code)) => *code,
        Some(ExitError::Signal(sig)) => 128 + sig,
        Some(ExitError::Launch { kind, .. }) if *kind == io::ErrorKind::NotFound => 127,
        Some(ExitError::Launch { .. }) => 126,
        Some(ExitError::Stream(_)) | Some(ExitError::Wait(_)) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lush_core::SessionConfig;

    #[test]
    fn build_chains_in_order() {
        let session = Session::new(SessionConfig::default());
        let lines = vec!["echo  hello   world".to_string(), "tr a-z A-Z".to_string()];
        let cmds = build(&session, &lines).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].argv(), vec!["echo", "hello", "world"]);
        assert_eq!(cmds[0].stdout().downstream(), vec![cmds[1].id()]);
        assert!(cmds[1].stdout().downstream().is_empty());
    }

    #[test]
    fn blank_command_is_rejected() {
        let session = Session::default();
        assert!(build(&session, &["   ".to_string()]).is_err());
    }

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(exit_code(None), 0);
        assert_eq!(exit_code(Some(&ExitError::Code(3))), 3);
        assert_eq!(exit_code(Some(&ExitError::Signal(2))), 130);
        let missing = ExitError::Launch {
            program: "nope".into(),
            kind: io::ErrorKind::NotFound,
            message: "not found".into(),
        };
        assert_eq!(exit_code(Some(&missing)), 127);
        assert_eq!(exit_code(Some(&ExitError::Stream("gone".into()))), 1);
    }
}
