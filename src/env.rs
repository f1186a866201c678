use crate::command::ExitCode;
use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;

/// Shell state that builtins may read or change.
///
/// Forked children get a copy; only changes made in the shell process itself
/// (by `cd` and `exit`) outlive the command.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Overrides consulted before the process environment. Starts empty; a
    /// session can shadow `HOME` or `USER` here without calling the unsafe
    /// `std::env::set_var` on a process that forks.
    pub vars: HashMap<String, String>,
    /// Working directory, kept in sync by `cd`.
    pub current_dir: PathBuf,
    /// Status the read-eval loop should stop with.
    pub exit_request: Option<ExitCode>,
}

impl Environment {
    /// No overrides, working directory taken from the process.
    pub fn new() -> Self {
        let vars = HashMap::new();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            vars,
            current_dir,
            exit_request: None,
        }
    }

    /// `vars` first, then the process environment.
    pub fn get_var(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .cloned()
            .or_else(|| stdenv::var(key).ok())
    }

    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Last component of the working directory, as shown in the prompt.
    pub fn dir_basename(&self) -> String {
        match self.current_dir.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.current_dir.to_string_lossy().into_owned(),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
