use std::fmt;

use failure::Fail;

/// Source position of a token or parsed item, 1-based.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Span { line, col }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Parse,
    Symbol,
    Range,
    Directive,
    Encode,
}

/// An assembly error with an optional source location.
///
/// Errors raised while walking parsed items carry the span of the
/// offending line; errors detected outside any source line (such as a
/// vector-table displacement overflow) carry none.
#[derive(Debug)]
pub struct AsmError {
    kind: ErrorKind,
    message: String,
    span: Option<Span>,
}

impl AsmError {
    fn with_kind(kind: ErrorKind, message: impl Into<String>, span: Option<Span>) -> Self {
        AsmError {
            kind,
            message: message.into(),
            span,
        }
    }

    pub fn lex(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Lex, message, Some(span))
    }

    pub fn parse(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Parse, message, Some(span))
    }

    pub fn symbol(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Symbol, message, Some(span))
    }

    pub fn range(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Range, message, Some(span))
    }

    pub fn directive(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Directive, message, Some(span))
    }

    pub fn encode(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Encode, message, Some(span))
    }

    /// An error that cannot be pinned to a source line.
    pub fn spanless(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::with_kind(kind, message, None)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.span {
            Some(span) => write!(f, "{}: {}", span, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl Fail for AsmError {}
