//! Runs a finalized command tree inside a forked child.
//!
//! [`Executor::run`] is an ordinary recursive function returning the status of
//! the tree. Only [`Executor::run_and_exit`], the entry point of every forked
//! child, terminates the process.

use crate::builtin::Builtins;
use crate::command::{ExitCode, INTERNAL_FAILURE};
use crate::env::Environment;
use crate::external::{self, ExternalCommand};
use crate::parser::{Cmd, RedirectMode};
use anyhow::{Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::sys::stat::Mode;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, close, dup2, fork, pipe};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::process;

/// Standard input on its own descriptor, bypassing `std::io::stdin()`.
///
/// The std handle is buffered and shared with the line editor, so it may hold
/// bytes that belong to the shell rather than to the command.
pub fn raw_stdin() -> io::Result<File> {
    Ok(File::from(io::stdin().as_fd().try_clone_to_owned()?))
}

/// Standard output on its own descriptor. Never touches the std lock, which a
/// forked child may have inherited in the locked state.
pub fn raw_stdout() -> io::Result<File> {
    Ok(File::from(io::stdout().as_fd().try_clone_to_owned()?))
}

pub struct Executor<'a> {
    builtins: &'a Builtins,
    env: &'a mut Environment,
}

impl<'a> Executor<'a> {
    pub fn new(builtins: &'a Builtins, env: &'a mut Environment) -> Self {
        Executor { builtins, env }
    }

    /// Runs `cmd` in the current process and returns its status.
    ///
    /// External programs replace the current process image, so this is only
    /// meant to be called from a forked child.
    pub fn run(&mut self, cmd: &Cmd) -> Result<ExitCode> {
        match cmd {
            Cmd::Exec { argv } => self.exec(argv),
            Cmd::Redirect {
                cmd,
                file,
                mode,
                fd,
            } => {
                if let Err(e) = redirect(file, *mode, *fd) {
                    eprintln!("open {} failed: {}", file, e);
                    return Ok(1);
                }
                self.run(cmd)
            }
            Cmd::List { left, right } => {
                let pid = self.spawn(left, || Ok(()))?;
                wait_for(pid)?;
                self.run(right)
            }
            Cmd::Pipe { left, right } => {
                let (reader, writer) = pipe().context("pipe")?;
                let left = self.spawn(left, || attach(&writer, STDOUT_FILENO, &reader))?;
                let right = self.spawn(right, || attach(&reader, STDIN_FILENO, &writer))?;
                drop(reader);
                drop(writer);
                wait_for(left)?;
                wait_for(right)?;
                Ok(0)
            }
            Cmd::Background { cmd } => {
                let pid = self.spawn(cmd, || Ok(()))?;
                debug!("background child {}", pid);
                Ok(0)
            }
        }
    }

    /// Runs `cmd` and terminates the process with its status.
    pub fn run_and_exit(&mut self, cmd: &Cmd) -> ! {
        let code = match self.run(cmd) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("forksh: {:#}", e);
                INTERNAL_FAILURE
            }
        };
        process::exit(code)
    }

    fn exec(&mut self, argv: &[String]) -> Result<ExitCode> {
        let Some((name, rest)) = argv.split_first() else {
            return Ok(0);
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();

        if let Some(builtin) = self.builtins.create(name, &args) {
            let mut stdin = raw_stdin().context("stdin")?;
            let mut stdout = BufWriter::new(raw_stdout().context("stdout")?);
            let code = builtin.execute(&mut stdin, &mut stdout, self.env)?;
            if let Err(e) = stdout.flush() {
                eprintln!("{}: {}", name, e);
                return Ok(1);
            }
            return Ok(code);
        }

        let err = match ExternalCommand::new(argv) {
            Ok(external) => external.exec(),
            Err(e) => e,
        };
        eprintln!("exec {} failed: {:#}", name, err);
        Ok(1)
    }

    /// Forks a child that runs `setup` and then `cmd`, never returning.
    fn spawn(&mut self, cmd: &Cmd, setup: impl FnOnce() -> Result<()>) -> Result<Pid> {
        // SAFETY: the child only runs this executor and then exits.
        match unsafe { fork() }.context("fork")? {
            ForkResult::Child => {
                if let Err(e) = setup() {
                    eprintln!("forksh: {:#}", e);
                    process::exit(INTERNAL_FAILURE);
                }
                self.run_and_exit(cmd)
            }
            ForkResult::Parent { child } => {
                debug!("forked {}", child);
                Ok(child)
            }
        }
    }
}

/// Puts `end` on `target` and closes both pipe descriptors in this process.
///
/// Called in a freshly forked child that never returns, so the owned handles
/// are not dropped there.
fn attach(end: &OwnedFd, target: RawFd, other: &OwnedFd) -> Result<()> {
    dup2(end.as_raw_fd(), target).context("dup2")?;
    close(end.as_raw_fd()).context("close")?;
    close(other.as_raw_fd()).context("close")?;
    Ok(())
}

/// Flags a redirection opens its file with.
pub fn open_flags(mode: RedirectMode) -> OFlag {
    match mode {
        RedirectMode::Read => OFlag::O_RDONLY,
        RedirectMode::Truncate => OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_TRUNC,
        RedirectMode::Append => OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_APPEND,
    }
}

/// Reopens descriptor `fd` on `file`.
pub fn redirect(file: &str, mode: RedirectMode, fd: RawFd) -> nix::Result<()> {
    // EBADF just means the slot was already free.
    let _ = close(fd);
    let opened = open(file, open_flags(mode), Mode::S_IRWXU)?;
    if opened != fd {
        dup2(opened, fd)?;
        close(opened)?;
    }
    Ok(())
}

/// Blocks until `pid` terminates and returns its status.
pub fn wait_for(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                debug!("reaped {} with {:?}", pid, external::exit_code(status));
                return Ok(status);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).with_context(|| format!("waitpid {}", pid)),
        }
    }
}

/// Reaps `pid` if it has already terminated.
pub fn try_reap(pid: Pid) -> Result<Option<WaitStatus>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(None),
        Ok(status) => {
            debug!("reaped {} with {:?}", pid, external::exit_code(status));
            Ok(Some(status))
        }
        Err(Errno::EINTR) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("waitpid {}", pid)),
    }
}
