use crate::builtin::Builtins;
use crate::command::{ExitCode, INTERNAL_FAILURE, Placement};
use crate::env::Environment;
use crate::executor::{self, Executor};
use crate::external;
use crate::parser::{Cmd, parse_cmd};
use crate::signals::{self, SESSION, WaitOutcome};
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid, User, fork, getuid};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::process;
use std::time::{Duration, Instant};

/// The interactive supervisor: reads lines, runs `cd`/`exit` itself and hands
/// everything else to a forked child bounded by the session timeout.
///
/// Example
/// ```no_run
/// use forksh::Interpreter;
/// let mut sh = Interpreter::default();
/// let code = sh.repl().unwrap();
/// std::process::exit(code);
/// ```
pub struct Interpreter {
    env: Environment,
    builtins: Builtins,
}

impl Interpreter {
    /// Create a new interpreter with a custom builtin registry.
    pub fn new(builtins: Builtins) -> Self {
        Self {
            env: Environment::new(),
            builtins,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Read-eval loop. Returns the status the shell should exit with.
    ///
    /// SIGINT and SIGCHLD stay blocked in the shell for the whole session;
    /// forked children unblock them before running anything.
    pub fn repl(&mut self) -> Result<ExitCode> {
        let mut rl = DefaultEditor::new()?;
        signals::block(&signals::supervisor_mask()).context("sigprocmask")?;

        loop {
            if let Some(code) = self.env.exit_request {
                return Ok(code);
            }
            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        if let Err(e) = rl.add_history_entry(line.as_str()) {
                            warn!("can't add history entry: {}", e);
                        }
                    }
                    self.eval(&line)?;
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Ok(0),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Parses and runs one line.
    ///
    /// Syntax errors are reported and swallowed; only failures of the shell
    /// itself (fork, signal masks, reaping) are returned.
    pub fn eval(&mut self, line: &str) -> Result<()> {
        let cmd = match parse_cmd(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("forksh: {}", e);
                return Ok(());
            }
        };
        debug!("parsed {:?}", cmd);

        if let Cmd::Exec { argv } = &cmd {
            let Some((name, rest)) = argv.split_first() else {
                return Ok(());
            };
            let args: Vec<&str> = rest.iter().map(String::as_str).collect();
            if let Some(builtin) = self.builtins.create(name, &args) {
                if builtin.placement() == Placement::Shell {
                    let mut stdin = executor::raw_stdin().context("stdin")?;
                    let mut stdout = io::stdout();
                    let code = builtin.execute(&mut stdin, &mut stdout, &mut self.env)?;
                    stdout.flush()?;
                    debug!("{} returned {}", name, code);
                    return Ok(());
                }
            }
        }

        self.run_foreground(&cmd)
    }

    /// Forks a child for `cmd` and waits for it at most the session timeout,
    /// killing it when the time is up.
    fn run_foreground(&mut self, cmd: &Cmd) -> Result<()> {
        signals::block_sigchld().context("sigprocmask")?;
        let _ = io::stdout().flush();

        // SAFETY: the child restores its signal mask, runs the executor and exits.
        let child = match unsafe { fork() }.context("fork")? {
            ForkResult::Child => {
                if let Err(e) = signals::unblock(&signals::supervisor_mask()) {
                    eprintln!("forksh: sigprocmask: {}", e);
                    process::exit(INTERNAL_FAILURE);
                }
                Executor::new(&self.builtins, &mut self.env).run_and_exit(cmd)
            }
            ForkResult::Parent { child } => child,
        };

        let timeout = Duration::from_secs(SESSION.timeout());
        debug!("foreground child {}, timeout {:?}", child, timeout);
        let status = supervise(child, timeout)?;
        debug!("foreground child {} finished: {:?}", child, external::exit_code(status));

        signals::rearm_sigchld().context("sigprocmask")?;
        Ok(())
    }

    /// `<user>@<basename of cwd>$ `
    pub fn prompt(&self) -> String {
        let user = User::from_uid(getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| self.env.get_var("USER"))
            .unwrap_or_else(|| "?".to_string());
        format!("{}@{}$ ", user, self.env.dir_basename())
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(Builtins::default())
    }
}

/// Waits for SIGCHLD until `child` is reaped or the deadline passes.
///
/// A SIGCHLD from some other child (e.g. a finished background job) only
/// resumes the wait with the time that is left.
fn supervise(child: Pid, timeout: Duration) -> Result<WaitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match signals::wait_for_sigchld(left).context("sigtimedwait")? {
            WaitOutcome::ChildSignalled => {
                SESSION.record_reaped();
                if let Some(status) = executor::try_reap(child)? {
                    return Ok(status);
                }
            }
            WaitOutcome::TimedOut => {
                if let Err(e) = kill(child, Signal::SIGKILL) {
                    warn!("kill {}: {}", child, e);
                }
                eprintln!(
                    "forksh: [{}] killed child with PID {}",
                    SESSION.reaped(),
                    child
                );
                return executor::wait_for(child);
            }
        }
    }
}
