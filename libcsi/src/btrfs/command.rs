//! External command execution.
//!
//! All filesystem side effects go through a [`CommandRunner`] so the
//! subvolume layer can be exercised without a btrfs filesystem or root
//! privileges.  [`SystemRunner`] is the production implementation.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use super::error::BtrfsError;

/// Exit status plus combined stdout+stderr of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs an external program to completion.
///
/// A non-zero exit is **not** an error at this level: callers such as the
/// quota check need to inspect the exact exit code.  `Err` is reserved for a
/// program that could not be started.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BtrfsError>;
}

/// Render a command line for logs and error messages.
pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BtrfsError> {
        let command = command_line(program, args);
        debug!(%command, "executing command");

        let out = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BtrfsError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            code: out.status.code(),
            output,
        })
    }
}
