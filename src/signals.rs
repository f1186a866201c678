//! Process-wide session state driven by signals.
//!
//! Signal handlers in this module only touch atomics. Everything else (waiting
//! for a child, masking, re-arming) happens in ordinary code on the main loop.

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Foreground timeout the shell starts with, in seconds.
pub const DEFAULT_TIMEOUT: u64 = 5;
/// Amount SIGUSR1/SIGUSR2 add to or remove from the timeout. Also its floor.
pub const TIMEOUT_STEP: u64 = 5;

/// Foreground timeout and reaped-children counter.
#[derive(Debug)]
pub struct SessionState {
    timeout: AtomicU64,
    reaped: AtomicUsize,
}

impl SessionState {
    pub const fn new(timeout: u64) -> Self {
        SessionState {
            timeout: AtomicU64::new(timeout),
            reaped: AtomicUsize::new(0),
        }
    }

    /// Current foreground timeout in seconds.
    pub fn timeout(&self) -> u64 {
        self.timeout.load(Ordering::SeqCst)
    }

    /// Sets the timeout, never going below [`TIMEOUT_STEP`].
    pub fn set_timeout(&self, secs: u64) {
        self.timeout
            .store(secs.max(TIMEOUT_STEP), Ordering::SeqCst);
    }

    pub fn increase_timeout(&self) {
        self.timeout.fetch_add(TIMEOUT_STEP, Ordering::SeqCst);
    }

    /// Removes one step unless that would bring the timeout under the floor.
    pub fn decrease_timeout(&self) {
        let _ = self
            .timeout
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                (t > TIMEOUT_STEP).then(|| t - TIMEOUT_STEP)
            });
    }

    pub fn record_reaped(&self) {
        self.reaped.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of child-termination notifications seen so far.
    pub fn reaped(&self) -> usize {
        self.reaped.load(Ordering::SeqCst)
    }
}

/// The shell's session, shared with the signal handlers.
pub static SESSION: SessionState = SessionState::new(DEFAULT_TIMEOUT);

extern "C" fn on_sigchld(_: c_int) {
    SESSION.record_reaped();
}

extern "C" fn on_sigusr(sig: c_int) {
    if sig == Signal::SIGUSR1 as c_int {
        SESSION.increase_timeout();
    } else if sig == Signal::SIGUSR2 as c_int {
        SESSION.decrease_timeout();
    }
}

/// Installs the SIGCHLD counter and the SIGUSR1/SIGUSR2 timeout handlers.
pub fn install_handlers() -> nix::Result<()> {
    let chld = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let usr = SigAction::new(
        SigHandler::Handler(on_sigusr),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handlers only perform atomic operations on a static.
    unsafe {
        sigaction(Signal::SIGCHLD, &chld)?;
        sigaction(Signal::SIGUSR1, &usr)?;
        sigaction(Signal::SIGUSR2, &usr)?;
    }
    Ok(())
}

/// Signals the shell keeps blocked between commands.
pub fn supervisor_mask() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGCHLD);
    set
}

fn sigchld_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set
}

pub fn block(set: &SigSet) -> nix::Result<()> {
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(set), None)
}

pub fn unblock(set: &SigSet) -> nix::Result<()> {
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(set), None)
}

/// Blocks SIGCHLD so a child that exits early cannot be missed by
/// [`wait_for_sigchld`].
pub fn block_sigchld() -> nix::Result<()> {
    block(&sigchld_set())
}

/// Lets a SIGCHLD left pending run the counting handler, then blocks it again.
pub fn rearm_sigchld() -> nix::Result<()> {
    let set = sigchld_set();
    unblock(&set)?;
    block(&set)
}

/// How the wait for the foreground child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// SIGCHLD arrived.
    ChildSignalled,
    /// Nothing arrived before the deadline.
    TimedOut,
}

/// Waits for a blocked SIGCHLD, for at most `timeout`.
///
/// Interruptions by other signals resume the wait with the time that is left.
pub fn wait_for_sigchld(timeout: Duration) -> nix::Result<WaitOutcome> {
    let set = sigchld_set();
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let ts = libc::timespec {
            tv_sec: left.as_secs() as libc::time_t,
            tv_nsec: left.subsec_nanos() as _,
        };
        // SAFETY: `set` and `ts` outlive the call; the info pointer may be null.
        let rc = unsafe { libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &ts) };
        if rc >= 0 {
            return Ok(WaitOutcome::ChildSignalled);
        }
        match Errno::last() {
            Errno::EAGAIN => return Ok(WaitOutcome::TimedOut),
            Errno::EINTR => continue,
            err => return Err(err),
        }
    }
}
