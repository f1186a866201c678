use crate::command::ExitCode;
use anyhow::{Context, Result};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::execvp;
use std::ffi::CString;

/// Command that is not a builtin: replaces the current process image.
pub struct ExternalCommand {
    argv: Vec<CString>,
}

impl ExternalCommand {
    /// Prepare the argument vector. The program is `argv[0]`, looked up in `PATH`.
    pub fn new(argv: &[String]) -> Result<Self> {
        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()).with_context(|| format!("bad argument {:?}", arg)))
            .collect::<Result<Vec<_>>>()?;
        if argv.is_empty() {
            anyhow::bail!("empty command");
        }
        Ok(Self { argv })
    }

    /// Run the program in place of the current process.
    ///
    /// Only returns if the replacement failed, with the reason.
    pub fn exec(self) -> anyhow::Error {
        // The Rust runtime ignores SIGPIPE, and an ignored disposition survives exec.
        // SAFETY: SIG_DFL installs no handler.
        if let Err(errno) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
            return anyhow::Error::from(errno).context("restore SIGPIPE");
        }
        match execvp(&self.argv[0], &self.argv) {
            Ok(never) => match never {},
            Err(errno) => errno.into(),
        }
    }
}

/// Shell-style status of a reaped child.
///
/// Normal exits give their code, deaths by signal give `128 + signal`.
pub fn exit_code(status: WaitStatus) -> Option<ExitCode> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(terminated_by_signal(signal as i32)),
        _ => None,
    }
}

fn terminated_by_signal(signal: i32) -> ExitCode {
    128 + signal
}
