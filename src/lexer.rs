//! A module implementing lexical analysis (tokenization) for the command line.
//!
//! The lexer never allocates: it walks a borrowed input buffer with a [`Cursor`]
//! and hands out [`Span`]s that point back into that buffer.

/// Bytes that separate tokens.
pub const WHITESPACE: &[u8] = b" \t\r\n\x0b";
/// Bytes that form operator tokens on their own.
pub const SYMBOLS: &[u8] = b"<|>&;()";

/// A half-open `[start, end)` byte range into the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    /// Returns the text this span covers in `buf`.
    ///
    /// Spans always start and end next to ASCII bytes, so slicing a `str` with
    /// them cannot split a multi-byte character.
    pub fn as_str<'a>(&self, buf: &'a str) -> &'a str {
        &buf[self.start..self.end]
    }

}

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A program name, argument or file name.
    Argument(Span),
    /// The pipe operator, `|`.
    Pipe,
    /// Input redirection symbol, `<`.
    RedirectIn,
    /// Output redirection symbol, `>`.
    RedirectOut,
    /// Appending output redirection, `>>`.
    Append,
    /// Sequencing operator, `;`.
    Sequence,
    /// Background operator, `&`.
    Background,
    /// Opening parenthesis of a block, `(`.
    GroupOpen,
    /// Closing parenthesis of a block, `)`.
    GroupClose,
    /// No input left.
    End,
}

/// Scanning position over a fixed input buffer.
pub struct Cursor<'a> {
    line: &'a str,
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor positioned at the first byte of `line`.
    pub fn new(line: &'a str) -> Self {
        Cursor {
            line,
            input: line.as_bytes(),
            pos: 0,
        }
    }

    #[cfg(test)]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// The unconsumed part of the input.
    pub fn remainder(&self) -> &'a str {
        self.line.get(self.pos..).unwrap_or("")
    }

    fn current(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.current().is_some_and(|b| WHITESPACE.contains(&b)) {
            self.pos += 1;
        }
    }

    /// Consumes and returns the next token.
    ///
    /// Leading whitespace is skipped first, and after the token the cursor is
    /// advanced past trailing whitespace, so it always rests on the first byte
    /// of the next token or at the end of the buffer.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        let start = self.pos;
        let token = match self.current() {
            None => Token::End,
            Some(b'|') => self.single(Token::Pipe),
            Some(b'(') => self.single(Token::GroupOpen),
            Some(b')') => self.single(Token::GroupClose),
            Some(b';') => self.single(Token::Sequence),
            Some(b'&') => self.single(Token::Background),
            Some(b'<') => self.single(Token::RedirectIn),
            Some(b'>') => {
                self.pos += 1;
                if self.current() == Some(b'>') {
                    self.pos += 1;
                    Token::Append
                } else {
                    Token::RedirectOut
                }
            }
            Some(_) => {
                while self
                    .current()
                    .is_some_and(|b| !WHITESPACE.contains(&b) && !SYMBOLS.contains(&b))
                {
                    self.pos += 1;
                }
                Token::Argument(Span::new(start, self.pos))
            }
        };
        self.skip_whitespace();
        token
    }

    fn single(&mut self, token: Token) -> Token {
        self.pos += 1;
        token
    }

    /// Skips whitespace and reports whether the next byte belongs to `charset`.
    ///
    /// The cursor stays past the whitespace even when nothing matches. Nothing
    /// else is consumed.
    pub fn peek(&mut self, charset: &[u8]) -> bool {
        self.skip_whitespace();
        self.current().is_some_and(|b| charset.contains(&b))
    }
}
