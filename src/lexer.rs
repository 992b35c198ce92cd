use combine::easy;
use combine::error::{ParseError, StreamError};
use combine::parser::byte::{alpha_num, byte, bytes, digit, hex_digit, letter};
use combine::parser::range::{range, recognize};
use combine::stream::{RangeStream, Stream, StreamErrorFor};
use combine::{
    any, attempt, between, choice, many, none_of, optional, position, satisfy, skip_many,
    skip_many1, EasyParser, Parser,
};

use std::fmt;
use std::str;

use crate::error::{AsmError, Span};

/// Direction of a numeric local-label reference (`1b` / `1f`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LocalDir {
    Back,
    Fwd,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token<'a> {
    Directive(&'a str),
    Ident(&'a str),
    Register(u8),
    Pair(u8, u8),
    LocalRef(u32, LocalDir),
    Str(String),
    Int(i64),
    Char(u8),
    Eol,
    LParen,
    RParen,
    Colon,
    Comma,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Mod,
    ShiftLeft,
    ShiftRight,
    BitNot,
    BitAnd,
    BitOr,
    BitXor,
    LogicalNot,
}

impl<'a> fmt::Display for Token<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        use self::Token::*;
        match self {
            Directive(s) => write!(f, ".{}", s),
            Ident(s) => write!(f, "{}", s),
            Register(n) => write!(f, "r{}", n),
            Pair(hi, lo) => write!(f, "r{}:r{}", hi, lo),
            LocalRef(n, LocalDir::Back) => write!(f, "{}b", n),
            LocalRef(n, LocalDir::Fwd) => write!(f, "{}f", n),
            Str(s) => write!(f, r#""{}""#, s),
            Int(n) => write!(f, "{}", n),
            Char(c) => write!(f, "'{}'", char::from(*c)),
            Eol => f.write_str("EOL"),
            LParen => f.write_str("("),
            RParen => f.write_str(")"),
            Colon => f.write_str(":"),
            Comma => f.write_str(","),
            Assign => f.write_str("="),
            Plus => f.write_str("+"),
            Minus => f.write_str("-"),
            Star => f.write_str("*"),
            Slash => f.write_str("/"),
            Mod => f.write_str("%"),
            ShiftLeft => f.write_str("<<"),
            ShiftRight => f.write_str(">>"),
            BitNot => f.write_str("~"),
            BitAnd => f.write_str("&"),
            BitOr => f.write_str("|"),
            BitXor => f.write_str("^"),
            LogicalNot => f.write_str("!"),
        }
    }
}

fn is_hspace(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn hspace<'a, I>() -> impl Parser<I, Output = ()>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    let comment = byte(b';').with(skip_many(satisfy(|c: u8| c != b'\n' && c != b'\r')));
    skip_many(satisfy(is_hspace))
        .map(|_| ())
        .skip(optional(comment))
        .silent()
}

fn ident_str<'a, I>() -> impl Parser<I, Output = &'a str>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    recognize(skip_many1(letter().or(byte(b'_'))).with(skip_many(alpha_num().or(byte(b'_')))))
        .map(|ident| str::from_utf8(ident).unwrap())
}

fn directive_str<'a, I>() -> impl Parser<I, Output = &'a str>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    byte(b'.')
        .with(recognize(
            skip_many1(letter().or(byte(b'_'))).with(skip_many(alpha_num().or(byte(b'_')))),
        ))
        .map(|ident| str::from_utf8(ident).unwrap())
}

// Recognizes `rN` including any trailing identifier characters, then
// insists the whole word really is a register; `r32` and `r16x` fail
// and fall back to the identifier branch.
fn register_num<'a, I>() -> impl Parser<I, Output = u8> + use<'a, I>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    recognize((
        satisfy(|c: u8| c == b'r' || c == b'R'),
        skip_many1(digit()),
        skip_many(alpha_num().or(byte(b'_'))),
    ))
    .and_then(|word: &[u8]| {
        let word = str::from_utf8(word).unwrap();
        match word[1..].parse::<u8>() {
            Ok(n) if n < 32 => Ok(n),
            _ => Err(StreamErrorFor::<I>::message_static_message(
                "not a register name",
            )),
        }
    })
}

fn register_token<'a, I>() -> impl Parser<I, Output = Token<'a>>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        attempt((register_num(), byte(b':'), register_num()))
            .map(|(hi, _, lo)| Token::Pair(hi, lo)),
        attempt(register_num()).map(Token::Register),
    ))
}

// `1b` / `2f` style references to numeric labels. `0b101` must stay a
// binary literal, so the trailing characters are recognized too and the
// whole word is classified afterwards.
fn local_ref_token<'a, I>() -> impl Parser<I, Output = Token<'a>>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    attempt(
        recognize((
            skip_many1(digit()),
            satisfy(|c: u8| c == b'b' || c == b'B' || c == b'f' || c == b'F'),
            skip_many(alpha_num().or(byte(b'_'))),
        ))
        .and_then(|word: &[u8]| {
            let suffix = word
                .iter()
                .position(|b| !b.is_ascii_digit())
                .expect("local ref has a suffix");
            if suffix + 1 != word.len() {
                return Err(StreamErrorFor::<I>::message_static_message(
                    "not a local label reference",
                ));
            }
            let dir = match word[suffix] {
                b'b' | b'B' => LocalDir::Back,
                _ => LocalDir::Fwd,
            };
            str::from_utf8(&word[..suffix])
                .unwrap()
                .parse::<u32>()
                .map(|n| Token::LocalRef(n, dir))
                .map_err(StreamErrorFor::<I>::other)
        }),
    )
}

fn int_token<'a, I>() -> impl Parser<I, Output = Token<'a>>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    let hex = || {
        choice((
            byte(b'$').map(|_| ()),
            attempt(range(&b"0x"[..])).map(|_| ()),
            attempt(range(&b"0X"[..])).map(|_| ()),
        ))
        .with(recognize(skip_many1(hex_digit())))
        .and_then(|digits: &[u8]| {
            i64::from_str_radix(str::from_utf8(digits).unwrap(), 16)
                .map_err(StreamErrorFor::<I>::other)
        })
    };
    let binary = || {
        choice((
            attempt(range(&b"0b"[..])).map(|_| ()),
            attempt(range(&b"0B"[..])).map(|_| ()),
        ))
        .with(recognize(skip_many1(satisfy(|c: u8| {
            c == b'0' || c == b'1'
        }))))
        .and_then(|digits: &[u8]| {
            i64::from_str_radix(str::from_utf8(digits).unwrap(), 2)
                .map_err(StreamErrorFor::<I>::other)
        })
    };
    // Decimal, or octal with a leading zero.
    let decimal = || {
        recognize(skip_many1(digit())).and_then(|digits: &[u8]| {
            let digits = str::from_utf8(digits).unwrap();
            let result = if digits.len() > 1 && digits.starts_with('0') {
                i64::from_str_radix(&digits[1..], 8)
            } else {
                digits.parse::<i64>()
            };
            result.map_err(StreamErrorFor::<I>::other)
        })
    };
    choice((attempt(hex()), attempt(binary()), decimal())).map(Token::Int)
}

fn operator_token<'a, I>() -> impl Parser<I, Output = Token<'a>>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        attempt(bytes(b"<<")).map(|_| Token::ShiftLeft),
        attempt(bytes(b">>")).map(|_| Token::ShiftRight),
        byte(b'+').map(|_| Token::Plus),
        byte(b'-').map(|_| Token::Minus),
        byte(b'*').map(|_| Token::Star),
        byte(b'/').map(|_| Token::Slash),
        byte(b'%').map(|_| Token::Mod),
        byte(b'&').map(|_| Token::BitAnd),
        byte(b'|').map(|_| Token::BitOr),
        byte(b'^').map(|_| Token::BitXor),
        byte(b'~').map(|_| Token::BitNot),
        byte(b'!').map(|_| Token::LogicalNot),
        byte(b',').map(|_| Token::Comma),
        byte(b'=').map(|_| Token::Assign),
        byte(b':').map(|_| Token::Colon),
    ))
}

fn escaped_byte<I>(terminators: &'static [u8]) -> impl Parser<I, Output = u8>
where
    I: Stream<Token = u8>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        byte(b'\\').with(any().map(|escaped| match escaped {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            _ => escaped,
        })),
        none_of(terminators.iter().cloned()),
    ))
}

fn char_literal<I>() -> impl Parser<I, Output = u8>
where
    I: Stream<Token = u8>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    between(byte(b'\''), byte(b'\''), escaped_byte(&[b'\'', b'\n', b'\r']))
}

fn string_literal<I>() -> impl Parser<I, Output = String>
where
    I: Stream<Token = u8>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    between(
        byte(b'"'),
        byte(b'"'),
        many(escaped_byte(&[b'"', b'\n', b'\r'])),
    )
    .and_then(|bs| String::from_utf8(bs).map_err(StreamErrorFor::<I>::other))
}

pub fn tokens<'a, I>() -> impl Parser<I, Output = Vec<(I::Position, Token<'a>)>>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    fn unit<T>(_: T) {}
    let tok = choice((
        byte(b'(').map(|_| Token::LParen),
        byte(b')').map(|_| Token::RParen),
        register_token(),
        local_ref_token(),
        ident_str().map(Token::Ident),
        directive_str().map(Token::Directive),
        int_token(),
        string_literal().map(Token::Str),
        char_literal().map(Token::Char),
        operator_token(),
        hspace()
            .with(choice((
                attempt(bytes(b"\r\n")).map(unit),
                byte(b'\r').map(unit),
                byte(b'\n').map(unit),
            )))
            .map(|_| Token::Eol),
    ));
    hspace().with(many((position(), tok).skip(hspace())))
}

/// A token together with its source position.
#[derive(Clone, Debug, PartialEq)]
pub struct SpannedToken<'a> {
    pub span: Span,
    pub token: Token<'a>,
}

struct LineMap {
    starts: Vec<usize>,
}

impl LineMap {
    fn new(input: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in input.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        LineMap { starts }
    }

    fn locate(&self, offset: usize) -> Span {
        let line = self.starts.partition_point(|&start| start <= offset);
        Span::new(line as u32, (offset - self.starts[line - 1] + 1) as u32)
    }
}

fn describe_errors(errors: &[easy::Error<u8, &[u8]>]) -> String {
    for error in errors {
        match error {
            easy::Error::Other(err) => return err.to_string(),
            easy::Error::Message(easy::Info::Owned(msg)) => return msg.clone(),
            easy::Error::Message(easy::Info::Static(msg)) => return (*msg).to_string(),
            _ => {}
        }
    }
    "malformed token".to_string()
}

/// Tokenizes a whole source file, attaching line/column spans.
pub fn tokenize(input: &str) -> Result<Vec<SpannedToken<'_>>, AsmError> {
    let bytes_ = input.as_bytes();
    let map = LineMap::new(input);
    let (raw, rest) = tokens().easy_parse(bytes_).map_err(|err| {
        let offset = err.position.translate_position(bytes_);
        AsmError::lex(describe_errors(&err.errors), map.locate(offset))
    })?;
    if !rest.is_empty() {
        let offset = bytes_.len() - rest.len();
        return Err(AsmError::lex(
            format!(
                "unexpected character `{}`",
                char::from(rest[0]).escape_default()
            ),
            map.locate(offset),
        ));
    }
    Ok(raw
        .into_iter()
        .map(|(pos, token)| SpannedToken {
            span: map.locate(pos.translate_position(bytes_)),
            token,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn lex(input: &str) -> Vec<Token> {
        tokenize(input)
            .expect("lexing failed")
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_int_bases() {
        assert_eq!(
            lex("1 42 0x2A $2a 0b1010 017 0"),
            vec![1, 42, 0x2A, 0x2A, 10, 0o17, 0]
                .into_iter()
                .map(Token::Int)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_bad_octal() {
        let err = tokenize("08").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lex);
    }

    #[test]
    fn test_registers() {
        assert_eq!(
            lex("r0 R31 r32 r16x"),
            vec![
                Token::Register(0),
                Token::Register(31),
                Token::Ident("r32"),
                Token::Ident("r16x"),
            ]
        );
    }

    #[test]
    fn test_register_pairs() {
        assert_eq!(
            lex("r1:r0 r25:r24"),
            vec![Token::Pair(1, 0), Token::Pair(25, 24)]
        );
        // A label named `r1` does not exist; the colon stays separate.
        assert_eq!(
            lex("r1: r0"),
            vec![Token::Register(1), Token::Colon, Token::Register(0)]
        );
    }

    #[test]
    fn test_local_refs() {
        assert_eq!(
            lex("1b 2f 0b11"),
            vec![
                Token::LocalRef(1, LocalDir::Back),
                Token::LocalRef(2, LocalDir::Fwd),
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn test_directive() {
        assert_eq!(lex(".equ"), vec![Token::Directive("equ")]);
        assert_eq!(
            lex(".section .text"),
            vec![Token::Directive("section"), Token::Directive("text")]
        );
    }

    #[test]
    fn test_operators() {
        use super::Token::*;
        assert_eq!(
            lex("+ - * / % & | ^ ~ ! << >> = : , ( )"),
            vec![
                Plus, Minus, Star, Slash, Mod, BitAnd, BitOr, BitXor, BitNot, LogicalNot,
                ShiftLeft, ShiftRight, Assign, Colon, Comma, LParen, RParen,
            ]
        );
    }

    #[test]
    fn test_strings_and_chars() {
        assert_eq!(
            lex(r#""Hello" '\t' ';'"#),
            vec![
                Token::Str("Hello".into()),
                Token::Char(b'\t'),
                Token::Char(b';'),
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("\"abc").is_err());
    }

    #[test]
    fn test_comments_and_eol() {
        assert_eq!(
            lex("nop ; increment\n; full line comment\r\n  dec r16"),
            vec![
                Token::Ident("nop"),
                Token::Eol,
                Token::Eol,
                Token::Ident("dec"),
                Token::Register(16),
            ]
        );
    }

    #[test]
    fn test_leading_whitespace() {
        assert_eq!(
            lex("\tldi r16, 1"),
            vec![
                Token::Ident("ldi"),
                Token::Register(16),
                Token::Comma,
                Token::Int(1),
            ]
        );
    }

    #[test]
    fn test_spans() {
        let tokens = tokenize("  ldi r16\n nop").expect("lexing failed");
        let spans: Vec<(u32, u32)> = tokens.iter().map(|t| (t.span.line, t.span.col)).collect();
        assert_eq!(spans, vec![(1, 3), (1, 7), (1, 10), (2, 2)]);
        assert_eq!(tokens[3].token, Token::Ident("nop"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("ldi r16, #1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lex);
        assert_eq!(err.span().unwrap().col, 10);
    }
}
