//! Recursive-descent parser turning a command line into a command tree.
//!
//! Grammar, from the loosest binding construct to the tightest:
//!
//! ```text
//! line          := pipeline ('&')* (';' line)?
//! pipeline      := exec_or_block ('|' pipeline)?
//! exec_or_block := '(' line ')' redirs | exec
//! exec          := redirs (argument redirs)*
//! redirs        := (('<' | '>' | '>>') argument)*
//! ```
//!
//! [`construct_ast`] produces a tree whose words are [`Span`]s into the input
//! line; [`finalize`] turns it into a tree of owned strings ready to execute.

use crate::lexer::{Cursor, Span, Token};
use std::os::fd::RawFd;

/// Upper bound on the argument vector, including the terminating sentinel.
pub const MAX_ARGS: usize = 15;

/// How the file of a redirection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// `<`: read-only, the file must exist.
    Read,
    /// `>`: created if missing, truncated if present.
    Truncate,
    /// `>>`: created if missing, appended to if present.
    Append,
}

/// A node of the command tree.
///
/// `W` is the word representation: [`Span`] right after parsing, `String`
/// once the tree has been finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd<W = String> {
    /// A simple command: program name followed by its arguments.
    Exec { argv: Vec<W> },
    /// Runs `cmd` with descriptor `fd` opened on `file`.
    Redirect {
        cmd: Box<Cmd<W>>,
        file: W,
        mode: RedirectMode,
        fd: RawFd,
    },
    /// `left | right`.
    Pipe { left: Box<Cmd<W>>, right: Box<Cmd<W>> },
    /// `left ; right`.
    List { left: Box<Cmd<W>>, right: Box<Cmd<W>> },
    /// `cmd &`.
    Background { cmd: Box<Cmd<W>> },
}

impl Cmd<String> {
    /// Program name when the tree is a bare simple command.
    #[cfg(test)]
    pub fn program(&self) -> Option<&str> {
        match self {
            Cmd::Exec { argv } => argv.first().map(String::as_str),
            _ => None,
        }
    }
}

/// Errors that can occur during the AST construction (parsing) phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParsingError {
    /// A redirection operator was not followed by a file name.
    #[error("missing file for redirection")]
    MissingRedirectTarget,
    /// A block was opened with `(` but never closed.
    #[error("syntax - missing )")]
    MissingCloseParen,
    /// A simple command has more arguments than [`MAX_ARGS`] allows.
    #[error("too many args (at most {})", MAX_ARGS - 1)]
    TooManyArgs,
    /// Encountered a token that was not expected at the current position.
    #[error("syntax - unexpected {0}")]
    UnexpectedToken(String),
    /// The grammar finished before the end of the line.
    #[error("syntax - trailing input: {0}")]
    TrailingInput(String),
}

fn describe(token: Token, line: &str) -> String {
    match token {
        Token::Argument(span) => format!("'{}'", span.as_str(line)),
        Token::Pipe => "'|'".to_string(),
        Token::RedirectIn => "'<'".to_string(),
        Token::RedirectOut => "'>'".to_string(),
        Token::Append => "'>>'".to_string(),
        Token::Sequence => "';'".to_string(),
        Token::Background => "'&'".to_string(),
        Token::GroupOpen => "'('".to_string(),
        Token::GroupClose => "')'".to_string(),
        Token::End => "end of line".to_string(),
    }
}

struct AstBuilder<'a> {
    line: &'a str,
    cursor: Cursor<'a>,
}

impl<'a> AstBuilder<'a> {
    fn from(line: &'a str) -> Self {
        AstBuilder {
            line,
            cursor: Cursor::new(line),
        }
    }

    fn build_ast(mut self) -> Result<Cmd<Span>, ParsingError> {
        let ast = self.parse_line()?;

        // Ensure we consumed the whole line
        self.cursor.peek(b"");
        if !self.cursor.is_at_end() {
            return Err(ParsingError::TrailingInput(
                self.cursor.remainder().to_string(),
            ));
        }

        Ok(ast)
    }

    /// Parse a line: pipeline ('&')* (';' line)?
    fn parse_line(&mut self) -> Result<Cmd<Span>, ParsingError> {
        let mut cmd = self.parse_pipeline()?;

        while self.cursor.peek(b"&") {
            self.cursor.next_token();
            cmd = Cmd::Background { cmd: Box::new(cmd) };
        }

        if self.cursor.peek(b";") {
            self.cursor.next_token();
            let right = self.parse_line()?;
            cmd = Cmd::List {
                left: Box::new(cmd),
                right: Box::new(right),
            };
        }

        Ok(cmd)
    }

    /// Parse a pipeline: exec_or_block ('|' pipeline)?
    fn parse_pipeline(&mut self) -> Result<Cmd<Span>, ParsingError> {
        let cmd = self.parse_exec()?;

        if self.cursor.peek(b"|") {
            self.cursor.next_token();
            let right = self.parse_pipeline()?;
            return Ok(Cmd::Pipe {
                left: Box::new(cmd),
                right: Box::new(right),
            });
        }

        Ok(cmd)
    }

    /// Parse one redirection operator and its file name, if there is one.
    fn parse_redir(&mut self) -> Result<Option<(Span, RedirectMode, RawFd)>, ParsingError> {
        if !self.cursor.peek(b"<>") {
            return Ok(None);
        }
        let operator = self.cursor.next_token();
        let file = match self.cursor.next_token() {
            Token::Argument(span) => span,
            _ => return Err(ParsingError::MissingRedirectTarget),
        };
        let (mode, fd) = match operator {
            Token::RedirectIn => (RedirectMode::Read, 0),
            Token::RedirectOut => (RedirectMode::Truncate, 1),
            Token::Append => (RedirectMode::Append, 1),
            other => return Err(ParsingError::UnexpectedToken(describe(other, self.line))),
        };
        Ok(Some((file, mode, fd)))
    }

    /// Parse redirections and wrap `cmd` in one `Redirect` node per operator.
    fn parse_redirs(&mut self, mut cmd: Cmd<Span>) -> Result<Cmd<Span>, ParsingError> {
        while let Some((file, mode, fd)) = self.parse_redir()? {
            cmd = Cmd::Redirect {
                cmd: Box::new(cmd),
                file,
                mode,
                fd,
            };
        }
        Ok(cmd)
    }

    /// Parse a parenthesized block followed by optional redirections.
    fn parse_block(&mut self) -> Result<Cmd<Span>, ParsingError> {
        self.cursor.next_token(); // consume the '('
        let cmd = self.parse_line()?;

        if !self.cursor.peek(b")") {
            return Err(ParsingError::MissingCloseParen);
        }
        self.cursor.next_token();

        self.parse_redirs(cmd)
    }

    /// Parse a command: redirs (argument redirs)*, or a block.
    ///
    /// Redirections may appear anywhere between the arguments; each one wraps
    /// whatever has been built so far, so `cmd > out arg` and `cmd arg > out`
    /// give the same tree.
    fn parse_exec(&mut self) -> Result<Cmd<Span>, ParsingError> {
        if self.cursor.peek(b"(") {
            return self.parse_block();
        }

        let mut argv = Vec::new();
        let mut redirs = Vec::new();

        while let Some(redir) = self.parse_redir()? {
            redirs.push(redir);
        }
        while !self.cursor.peek(b"|)&;") {
            match self.cursor.next_token() {
                Token::End => break,
                Token::Argument(span) => argv.push(span),
                other => {
                    return Err(ParsingError::UnexpectedToken(describe(other, self.line)));
                }
            }
            if argv.len() >= MAX_ARGS {
                return Err(ParsingError::TooManyArgs);
            }
            while let Some(redir) = self.parse_redir()? {
                redirs.push(redir);
            }
        }

        // Innermost redirection first, so the leftmost operator is applied first.
        Ok(redirs
            .into_iter()
            .fold(Cmd::Exec { argv }, |cmd, (file, mode, fd)| Cmd::Redirect {
                cmd: Box::new(cmd),
                file,
                mode,
                fd,
            }))
    }
}

/// Parse `line` into a command tree whose words are spans into `line`.
///
/// The whole line must be consumed; leftover text is reported as
/// [`ParsingError::TrailingInput`].
pub fn construct_ast(line: &str) -> Result<Cmd<Span>, ParsingError> {
    AstBuilder::from(line).build_ast()
}

/// Materialize every span of `cmd` as an owned string taken from `line`.
///
/// Each node is visited exactly once and only the bytes covered by the spans
/// are read.
pub fn finalize(cmd: Cmd<Span>, line: &str) -> Cmd<String> {
    match cmd {
        Cmd::Exec { argv } => Cmd::Exec {
            argv: argv
                .into_iter()
                .map(|span| span.as_str(line).to_string())
                .collect(),
        },
        Cmd::Redirect {
            cmd,
            file,
            mode,
            fd,
        } => Cmd::Redirect {
            cmd: Box::new(finalize(*cmd, line)),
            file: file.as_str(line).to_string(),
            mode,
            fd,
        },
        Cmd::Pipe { left, right } => Cmd::Pipe {
            left: Box::new(finalize(*left, line)),
            right: Box::new(finalize(*right, line)),
        },
        Cmd::List { left, right } => Cmd::List {
            left: Box::new(finalize(*left, line)),
            right: Box::new(finalize(*right, line)),
        },
        Cmd::Background { cmd } => Cmd::Background {
            cmd: Box::new(finalize(*cmd, line)),
        },
    }
}

/// Parse and finalize `line` in one step.
pub fn parse_cmd(line: &str) -> Result<Cmd, ParsingError> {
    let ast = construct_ast(line)?;
    Ok(finalize(ast, line))
}
