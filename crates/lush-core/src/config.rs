//! Session configuration: TOML file with per-field defaults.

use crate::{LushError, LushResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default scrollback per output stream, in bytes.
pub const DEFAULT_SCROLLBACK: usize = 1000;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub session: SessionConfig,
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Scrollback size for new commands' stdout.
    #[serde(default = "default_scrollback")]
    pub stdout_scrollback: usize,
    /// Scrollback size for new commands' stderr.
    #[serde(default = "default_scrollback")]
    pub stderr_scrollback: usize,
    /// Seed the session environment from this process's environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Initial working directory. Defaults to the process cwd.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Stack size for the supervisor and stream pump threads.
    #[serde(default = "default_pump_stack_size")]
    pub pump_stack_size: usize,
    /// Bytes read from a child's output per pump iteration.
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stdout_scrollback: default_scrollback(),
            stderr_scrollback: default_scrollback(),
            inherit_env: true,
            cwd: None,
            pump_stack_size: default_pump_stack_size(),
            read_chunk: default_read_chunk(),
        }
    }
}

fn default_scrollback() -> usize {
    DEFAULT_SCROLLBACK
}
fn default_true() -> bool {
    true
}
fn default_pump_stack_size() -> usize {
    128 * 1024
}
fn default_read_chunk() -> usize {
    32 * 1024
}

impl SessionConfig {
    /// Load the `[session]` table from a TOML file.
    ///
    /// A missing file (or no path) yields the defaults. `~/` is expanded in
    /// both the file path and the configured cwd.
    pub fn load(config_path: Option<&Path>) -> LushResult<Self> {
        let Some(path) = config_path else {
            return Ok(Self::default());
        };
        let expanded = expand_tilde(path);
        if !expanded.exists() {
            info!(path = %expanded.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> LushResult<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| LushError::Config(e.to_string()))?;
        let mut config = file.session;
        config.cwd = config.cwd.map(|p| expand_tilde(&p));
        if config.read_chunk == 0 {
            return Err(LushError::Config("read_chunk must be positive".into()));
        }
        Ok(config)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
