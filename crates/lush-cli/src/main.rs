//! lush: run a pipeline of external commands through a lush session.
//!
//! Each `-c` argument is one command, split on whitespace; consecutive
//! commands are connected stdout to stdin. The last command's stdout goes to
//! this process's stdout and every command's stderr to this process's stderr.

mod pipeline;

use anyhow::{Context, Result};
use clap::Parser;
use lush_core::{Session, SessionConfig, SharedSink, WriterSink};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// lush: process pipelines with scrollback
#[derive(Parser, Debug)]
#[command(name = "lush", version, about = "Run a pipeline of commands through a lush session")]
struct Cli {
    /// Command to run; repeat to build a pipeline
    #[arg(short = 'c', long = "cmd", required = true)]
    cmds: Vec<String>,

    /// Config file path
    #[arg(long, default_value = "~/.lush/config.toml")]
    config: PathBuf,

    /// Scrollback size in bytes for stdout and stderr of every command
    #[arg(long)]
    scrollback: Option<usize>,

    /// Working directory for the pipeline
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Forward this process's stdin to the first command
    #[arg(long)]
    stdin: bool,

    /// Print the final command table as JSON on stderr
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// File config with CLI overrides applied.
fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = SessionConfig::load(Some(cli.config.as_path()))
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(size) = cli.scrollback {
        config.stdout_scrollback = size;
        config.stderr_scrollback = size;
    }
    if let Some(cwd) = &cli.cwd {
        config.cwd = Some(cwd.clone());
    }
    Ok(config)
}

/// Copy our stdin into the command's stdin until EOF or until it stops
/// accepting input.
fn forward_stdin(stdin: Arc<lush_core::InStream>) {
    let spawned = std::thread::Builder::new()
        .name("lush-stdin".into())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            let mut input = io::stdin().lock();
            loop {
                match input.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = stdin.write(&buf[..n]) {
                            debug!(error = %e, "stdin forwarding stopped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }
            let _ = stdin.close();
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn stdin forwarder");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli)?;
    if let Some(cwd) = &config.cwd {
        anyhow::ensure!(cwd.is_dir(), "not a directory: {}", cwd.display());
    }
    let session = Session::new(config);
    let cmds = pipeline::build(&session, &cli.cmds)?;
    info!(commands = cmds.len(), cwd = %session.cwd().display(), "pipeline built");

    let out: SharedSink = Arc::new(WriterSink::new(io::stdout()));
    let err: SharedSink = Arc::new(WriterSink::new(io::stderr()));
    if let Some(last) = cmds.last() {
        last.stdout().add_sink(out);
    }
    for cmd in &cmds {
        cmd.stderr().add_sink(err.clone());
    }

    let first = cmds.first().context("no commands given")?;
    if cli.stdin {
        forward_stdin(first.stdin());
    } else {
        first.stdin().close()?;
    }

    pipeline::start_all(&cmds);

    let waiting = cmds.clone();
    let mut waiter = tokio::task::spawn_blocking(move || pipeline::wait_all(&waiting));
    let all_ok = loop {
        tokio::select! {
            res = &mut waiter => break res.context("waiter task failed")?,
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                info!("interrupt received, forwarding to running commands");
                for cmd in &cmds {
                    if cmd.status().is_running() {
                        let _ = cmd.signal(libc::SIGINT);
                    }
                }
            }
        }
    };
    debug!(all_ok, "pipeline finished");

    if cli.json {
        let table = serde_json::to_string_pretty(&session.command_infos())?;
        eprintln!("{table}");
    }

    let code = cmds
        .last()
        .map(|c| pipeline::exit_code(c.status().err().as_ref()))
        .unwrap_or(0);
    for cmd in &cmds {
        if let Err(e) = session.release_command(cmd.id()) {
            warn!(id = %cmd.id(), error = %e, "release failed");
        }
    }
    std::process::exit(code);
}
