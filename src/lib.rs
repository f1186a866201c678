//! A small interactive shell built directly on `fork`, `pipe` and `execvp`.
//!
//! A line goes through the [`lexer`], is parsed into a [`parser::Cmd`] tree
//! and run by the [`executor`] in a forked child. The [`Interpreter`] is the
//! supervising read-eval loop: it runs `cd` and `exit` in its own process and
//! kills a foreground child that outlives the session timeout, which SIGUSR1
//! and SIGUSR2 raise and lower (see [`signals`]).
//!
//! Builtins (`pwd`, `cd`, `exit`, `tee`, `du`) are parsed with `argh` and run
//! against the streams the executor hands them.

mod builtin;
pub mod command;
pub mod env;
pub mod executor;
mod external;
mod interpreter;
pub mod lexer;
pub mod parser;
pub mod signals;

pub use builtin::Builtins;

/// Just a convenient re-export of the interactive supervisor.
///
/// See [`Interpreter`] for the high-level API.
pub use interpreter::Interpreter;
pub use parser::{ParsingError, parse_cmd};
