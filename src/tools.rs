//! External executable invocation.
//!
//! Conversion tools (untwine, pdal) run out of process. They are reached
//! through [`CommandRunner`] so tests can substitute a fake without touching
//! a real executable.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Capability to run an external program to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and wait for it to exit.
    ///
    /// An `Err` means the process could not be started at all; a started
    /// process that fails is reported through [`CommandOutput::exit_code`].
    fn run(&self, program: &Path, args: &[OsString]) -> std::io::Result<CommandOutput>;
}

/// Runs programs with `std::process`, blocking the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> std::io::Result<CommandOutput> {
        tracing::debug!("Running {} {:?}", program.display(), args);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
