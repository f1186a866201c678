use crate::env::Environment;
use anyhow::Result;
use std::io::{Read, Write};

/// Status of a command or process: 0 is success.
pub type ExitCode = i32;

/// Status used when a process hits an internal failure (fork, pipe, ...).
pub const INTERNAL_FAILURE: ExitCode = -1;

/// Where a builtin has to run for its effect to be visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// In the shell's own process: the command changes process-wide state
    /// (working directory, termination) that a child could not hand back.
    Shell,
    /// In the forked child, next to external programs.
    Child,
}

/// A builtin ready to run, already bound to its arguments.
pub trait ExecutableCommand {
    /// Runs the command against the given streams.
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;

    /// Which process the command must run in.
    fn placement(&self) -> Placement;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// Attempt to create a command instance for the provided name and arguments.
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}
