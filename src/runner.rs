//! Single chokepoint for external command execution.
//!
//! Every command the engine issues goes through [`Runner`]: the fully
//! rendered command line is logged before anything runs, dry-run mode turns
//! execution into a distinguished [`BuildError::DidNotExecute`] sentinel,
//! and exploratory probes report exit status without treating non-zero as
//! fatal.

use std::process::{Command, Output, Stdio};

use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// Executes external commands, honoring dry-run mode.
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    dry_run: bool,
}

impl Runner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run to completion, capturing output. Non-zero exit is fatal.
    ///
    /// Under dry-run the command is logged and [`BuildError::DidNotExecute`]
    /// is returned without spawning anything.
    pub fn run(&self, cmd: &mut Command) -> Result<Output> {
        let line = render(cmd);
        if self.dry_run {
            info!("(dry-run) not executing: {line}");
            return Err(BuildError::DidNotExecute(line));
        }
        info!("executing: {line}");
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_failed(&line, e))?;
        check_status(&line, &output)?;
        Ok(output)
    }

    /// Run with stdio inherited, for long builds and interactive sessions.
    pub fn run_streamed(&self, cmd: &mut Command) -> Result<()> {
        let line = render(cmd);
        if self.dry_run {
            info!("(dry-run) not executing: {line}");
            return Err(BuildError::DidNotExecute(line));
        }
        info!("executing: {line}");
        let status = cmd.status().map_err(|e| spawn_failed(&line, e))?;
        if !status.success() {
            return Err(BuildError::CommandFailed {
                command: line,
                status: status.code().unwrap_or(-1),
                output: String::new(),
            });
        }
        Ok(())
    }

    /// Exploratory probe: always executes, even under dry-run, and a
    /// non-zero exit is informational rather than fatal.
    pub fn probe(&self, cmd: &mut Command) -> Result<Output> {
        let line = render(cmd);
        debug!("probing: {line}");
        cmd.stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_failed(&line, e))
    }
}

/// Swallow the dry-run sentinel at a call site that has nothing else to do.
///
/// Genuine failures still propagate; only [`BuildError::DidNotExecute`] is
/// converted to success.
pub fn skip_on_dry_run<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(BuildError::DidNotExecute(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Build a `Command` from a pre-rendered argument vector.
pub fn command_from(argv: &[String]) -> Command {
    assert!(!argv.is_empty(), "argument vector must name a program");
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Render a command line the way a shell user would retype it.
pub fn render(cmd: &Command) -> String {
    let mut parts = vec![quote(&cmd.get_program().to_string_lossy())];
    parts.extend(cmd.get_args().map(|a| quote(&a.to_string_lossy())));
    parts.join(" ")
}

fn quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@' | '+' | '%')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn spawn_failed(line: &str, e: std::io::Error) -> BuildError {
    BuildError::CommandFailed {
        command: line.to_string(),
        status: -1,
        output: format!("failed to spawn: {e}"),
    }
}

fn check_status(line: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(BuildError::CommandFailed {
        command: line.to_string(),
        status: output.status.code().unwrap_or(-1),
        output: text.trim_end().to_string(),
    })
}
