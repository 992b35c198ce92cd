use combine::error::{ParseError, StreamError};
use combine::stream::{Stream, StreamErrorFor};
use combine::{
    attempt, between, chainl1, choice, optional, satisfy_map, sep_by, token, EasyParser, Parser,
};

use crate::error::{AsmError, Span};
use crate::lexer::{LocalDir, SpannedToken, Token};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnaryOp {
    Minus,
    BitNot,
    LogicalNot,
    Lo8,
    Hi8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitXor,
    BitOr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Int(i64),
    Ident(String),
    LocalRef(u32, LocalDir),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }
    pub fn unary(op: UnaryOp, e: Expr) -> Self {
        Expr::Unary(op, Box::new(e))
    }
    pub fn binary(op: BinaryOp, e1: Expr, e2: Expr) -> Self {
        Expr::Binary(op, Box::new(e1), Box::new(e2))
    }
    pub fn add(e1: Expr, e2: Expr) -> Self {
        Self::binary(BinaryOp::Add, e1, e2)
    }
    pub fn subtract(e1: Expr, e2: Expr) -> Self {
        Self::binary(BinaryOp::Sub, e1, e2)
    }
    pub fn multiply(e1: Expr, e2: Expr) -> Self {
        Self::binary(BinaryOp::Mul, e1, e2)
    }
    pub fn minus(e: Expr) -> Self {
        Self::unary(UnaryOp::Minus, e)
    }
}

/// The X, Y and Z pointer registers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PtrReg {
    X,
    Y,
    Z,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Reg(u8),
    Pair { hi: u8, lo: u8 },
    Expr(Expr),
    Str(String),
    /// A bare pointer name. The written spelling is kept so that a
    /// symbol of the same name can satisfy a constant operand slot.
    Ptr { reg: PtrReg, name: String },
    PtrPostInc(PtrReg),
    PtrPreDec(PtrReg),
    PtrDisp(PtrReg, Expr),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SectionKind {
    Text,
    Data,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Label(String),
    NumericLabel(u32),
    Instruction {
        mnemonic: String,
        operands: Vec<Operand>,
    },
    Equ {
        name: String,
        value: Operand,
    },
    Default {
        name: String,
        value: Operand,
    },
    Section(SectionKind),
    Global(String),
    Byte(Vec<Operand>),
    Word(Vec<Expr>),
    Align(u32),
    Rept(u32),
    Endr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedItem {
    pub span: Span,
    pub item: Item,
}

enum RawLabel {
    Named(String),
    Numeric(u32),
}

enum RawBody {
    Assign {
        directive: String,
        name: String,
        value: Operand,
    },
    Section(String),
    Directive(String, Vec<Operand>),
    Instruction(String, Vec<Operand>),
}

struct RawLine(Option<RawLabel>, Option<RawBody>);

parser! {
    fn ident['a, I]()(I) -> String
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        satisfy_map(|t| match t {
            Token::Ident(name) => Some(name.to_string()),
            _ => None,
        })
    }
}

parser! {
    fn pointer['a, I]()(I) -> (PtrReg, String)
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        satisfy_map(|t| match t {
            Token::Ident(name) => {
                let reg = match name {
                    "x" | "X" => PtrReg::X,
                    "y" | "Y" => PtrReg::Y,
                    "z" | "Z" => PtrReg::Z,
                    _ => return None,
                };
                Some((reg, name.to_string()))
            }
            _ => None,
        })
    }
}

fn binary_op<'a, I>(
    p: impl Parser<I, Output = BinaryOp>,
) -> impl Parser<I, Output = impl Fn(Expr, Expr) -> Expr>
where
    I: Stream<Token = Token<'a>>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    p.map(|op| move |e1, e2| Expr::binary(op, e1, e2))
}

parser! {
    fn factor['a, I]()(I) -> Expr
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        let literal = || satisfy_map(|t| match t {
            Token::Int(n) => Some(Expr::Int(n)),
            Token::Char(c) => Some(Expr::Int(i64::from(c))),
            Token::LocalRef(n, dir) => Some(Expr::LocalRef(n, dir)),
            _ => None,
        });
        let ident_or_call = || (
            ident(),
            optional(between(token(Token::LParen), token(Token::RParen), expr())),
        )
            .and_then(|(id, arg)| match arg {
                None => Ok(Expr::Ident(id)),
                Some(e) => match id.to_ascii_lowercase().as_str() {
                    "lo8" => Ok(Expr::unary(UnaryOp::Lo8, e)),
                    "hi8" => Ok(Expr::unary(UnaryOp::Hi8, e)),
                    _ => Err(StreamErrorFor::<I>::message_static_message(
                        "unknown function, expected lo8 or hi8",
                    )),
                },
            });
        let unary_op = || choice((
            token(Token::Minus).map(|_| UnaryOp::Minus),
            token(Token::BitNot).map(|_| UnaryOp::BitNot),
            token(Token::LogicalNot).map(|_| UnaryOp::LogicalNot),
        ));
        let negated = || (unary_op(), factor()).map(|(op, e)| Expr::unary(op, e));
        choice((
            between(token(Token::LParen), token(Token::RParen), expr()),
            literal(),
            ident_or_call(),
            negated(),
        ))
    }
}

parser! {
    fn expr['a, I]()(I) -> Expr
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        use self::BinaryOp::*;

        let term_op = binary_op(choice((
            token(Token::Star).map(|_| Mul),
            token(Token::Slash).map(|_| Div),
            token(Token::Mod).map(|_| Rem),
        )));
        let arith_op = binary_op(choice((
            token(Token::Plus).map(|_| Add),
            token(Token::Minus).map(|_| Sub),
        )));
        let shift_op = binary_op(choice((
            token(Token::ShiftLeft).map(|_| Shl),
            token(Token::ShiftRight).map(|_| Shr),
        )));
        let term = chainl1(factor(), term_op);
        let arith = chainl1(term, arith_op);
        let shift = chainl1(arith, shift_op);
        let band = chainl1(shift, binary_op(token(Token::BitAnd).map(|_| BitAnd)));
        let bxor = chainl1(band, binary_op(token(Token::BitXor).map(|_| BitXor)));
        chainl1(bxor, binary_op(token(Token::BitOr).map(|_| BitOr)))
    }
}

parser! {
    fn operand['a, I]()(I) -> Operand
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        let reg_or_pair = || satisfy_map(|t| match t {
            Token::Register(n) => Some(Operand::Reg(n)),
            Token::Pair(hi, lo) => Some(Operand::Pair { hi, lo }),
            _ => None,
        });
        let string = || satisfy_map(|t| match t {
            Token::Str(s) => Some(Operand::Str(s)),
            _ => None,
        });
        let pre_dec = || (token(Token::Minus), pointer()).map(|(_, (reg, _))| Operand::PtrPreDec(reg));
        let indirect = || (
            pointer(),
            optional(token(Token::Plus).with(optional(expr()))),
        )
            .map(|((reg, name), suffix)| match suffix {
                None => Operand::Ptr { reg, name },
                Some(None) => Operand::PtrPostInc(reg),
                Some(Some(q)) => Operand::PtrDisp(reg, q),
            });
        choice((
            reg_or_pair(),
            string(),
            attempt(pre_dec()),
            indirect(),
            expr().map(Operand::Expr),
        ))
    }
}

parser! {
    fn operand_list['a, I]()(I) -> Vec<Operand>
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        sep_by(operand(), token(Token::Comma))
    }
}

parser! {
    fn line['a, I]()(I) -> RawLine
    where [
        I: Stream<Token = Token<'a>>,
        I::Error: ParseError<I::Token, I::Range, I::Position>,
    ]
    {
        let label = || attempt(
            choice((
                ident().map(RawLabel::Named),
                satisfy_map(|t| match t {
                    Token::Int(n) if n >= 0 && n <= i64::from(u32::MAX) => {
                        Some(RawLabel::Numeric(n as u32))
                    }
                    _ => None,
                }),
            ))
            .skip(token(Token::Colon)),
        );
        let directive_name = || satisfy_map(|t| match t {
            Token::Directive(name) => Some(name.to_ascii_lowercase()),
            _ => None,
        });
        let assign = attempt((directive_name(), ident(), token(Token::Assign), operand()))
            .map(|(directive, name, _, value)| RawBody::Assign { directive, name, value });
        let section = attempt((
            satisfy_map(|t| match t {
                Token::Directive(name) if name.eq_ignore_ascii_case("section") => Some(()),
                _ => None,
            }),
            satisfy_map(|t| match t {
                Token::Directive(name) => Some(name.to_string()),
                Token::Ident(name) => Some(name.to_string()),
                _ => None,
            }),
        ))
        .map(|(_, name)| RawBody::Section(name));
        let directive = (directive_name(), operand_list())
            .map(|(name, args)| RawBody::Directive(name, args));
        let instruction = (ident(), operand_list())
            .map(|(name, args)| RawBody::Instruction(name, args));
        (
            optional(label()),
            optional(choice((assign, section, directive, instruction))),
        )
            .map(|(label, body)| RawLine(label, body))
    }
}

/// Parses a token stream into items: recognizes every line, expands
/// `.rept` blocks and rewrites numeric local labels.
pub fn parse(tokens: &[SpannedToken]) -> Result<Vec<ParsedItem>, AsmError> {
    let mut items = Vec::new();
    for line_toks in tokens.split(|t| t.token == Token::Eol) {
        if line_toks.is_empty() {
            continue;
        }
        parse_line(line_toks, &mut items)?;
    }
    let items = expand_rept(items)?;
    resolve_local_labels(items)
}

fn parse_line(line_toks: &[SpannedToken], items: &mut Vec<ParsedItem>) -> Result<(), AsmError> {
    let span = line_toks[0].span;
    let toks: Vec<Token> = line_toks.iter().map(|t| t.token.clone()).collect();
    let (raw, rest) = line()
        .easy_parse(&toks[..])
        .map_err(|_| AsmError::parse("invalid syntax", span))?;
    if !rest.is_empty() {
        let at = toks.len() - rest.len();
        return Err(AsmError::parse(
            format!("unexpected token `{}`", line_toks[at].token),
            line_toks[at].span,
        ));
    }
    let RawLine(label, body) = raw;
    if let Some(label) = label {
        let item = match label {
            RawLabel::Named(name) => Item::Label(name),
            RawLabel::Numeric(n) => Item::NumericLabel(n),
        };
        items.push(ParsedItem { span, item });
    }
    if let Some(body) = body {
        let item = classify_body(body, span)?;
        items.push(ParsedItem { span, item });
    }
    Ok(())
}

fn classify_body(body: RawBody, span: Span) -> Result<Item, AsmError> {
    match body {
        RawBody::Instruction(name, operands) => Ok(Item::Instruction {
            mnemonic: name.to_ascii_lowercase(),
            operands,
        }),
        RawBody::Assign {
            directive,
            name,
            value,
        } => match directive.as_str() {
            "equ" => Ok(Item::Equ { name, value }),
            "default" => Ok(Item::Default { name, value }),
            _ => Err(AsmError::directive(
                format!("directive .{} does not take an assignment", directive),
                span,
            )),
        },
        RawBody::Section(name) => match name.as_str() {
            "text" => Ok(Item::Section(SectionKind::Text)),
            "data" => Ok(Item::Section(SectionKind::Data)),
            _ => Err(AsmError::directive(
                format!("unknown section `{}`", name),
                span,
            )),
        },
        RawBody::Directive(name, args) => classify_directive(&name, args, span),
    }
}

fn classify_directive(name: &str, args: Vec<Operand>, span: Span) -> Result<Item, AsmError> {
    match name {
        "equ" | "default" => Err(AsmError::directive(
            format!(".{} expects `NAME = value`", name),
            span,
        )),
        "global" => match args.as_slice() {
            [Operand::Expr(Expr::Ident(name))] => Ok(Item::Global(name.clone())),
            _ => Err(AsmError::directive(".global expects a symbol name", span)),
        },
        "byte" => {
            for arg in &args {
                match arg {
                    Operand::Expr(_) | Operand::Str(_) => {}
                    _ => {
                        return Err(AsmError::directive(
                            ".byte operands must be expressions or strings",
                            span,
                        ))
                    }
                }
            }
            Ok(Item::Byte(args))
        }
        "word" => {
            let mut exprs = Vec::with_capacity(args.len());
            for arg in args {
                match arg {
                    Operand::Expr(e) => exprs.push(e),
                    _ => {
                        return Err(AsmError::directive(
                            ".word operands must be expressions",
                            span,
                        ))
                    }
                }
            }
            Ok(Item::Word(exprs))
        }
        "align" => match args.as_slice() {
            [Operand::Expr(Expr::Int(n))] if *n > 0 && *n <= i64::from(u32::MAX) => {
                Ok(Item::Align(*n as u32))
            }
            _ => Err(AsmError::directive(
                ".align expects a positive integer literal",
                span,
            )),
        },
        "rept" => match args.as_slice() {
            [Operand::Expr(Expr::Int(n))] if *n >= 0 && *n <= i64::from(u32::MAX) => {
                Ok(Item::Rept(*n as u32))
            }
            _ => Err(AsmError::directive(
                ".rept count must be a non-negative integer literal",
                span,
            )),
        },
        "endr" => {
            if args.is_empty() {
                Ok(Item::Endr)
            } else {
                Err(AsmError::directive(".endr takes no operands", span))
            }
        }
        _ => Err(AsmError::directive(
            format!("unknown directive `.{}`", name),
            span,
        )),
    }
}

fn expand_rept(items: Vec<ParsedItem>) -> Result<Vec<ParsedItem>, AsmError> {
    let mut iter = items.into_iter();
    let expanded = expand_until(&mut iter, None)?;
    Ok(expanded)
}

fn expand_until(
    iter: &mut std::vec::IntoIter<ParsedItem>,
    open: Option<Span>,
) -> Result<Vec<ParsedItem>, AsmError> {
    let mut out = Vec::new();
    while let Some(pi) = iter.next() {
        match pi.item {
            Item::Rept(count) => {
                let body = expand_until(iter, Some(pi.span))?;
                for inner in &body {
                    if matches!(inner.item, Item::Label(_) | Item::NumericLabel(_)) {
                        return Err(AsmError::directive(
                            "labels are not allowed inside a .rept body",
                            inner.span,
                        ));
                    }
                }
                for _ in 0..count {
                    out.extend(body.iter().cloned());
                }
            }
            Item::Endr => {
                if open.is_some() {
                    return Ok(out);
                }
                return Err(AsmError::directive(".endr without matching .rept", pi.span));
            }
            _ => out.push(pi),
        }
    }
    if let Some(span) = open {
        return Err(AsmError::directive(".rept without matching .endr", span));
    }
    Ok(out)
}

fn lookup_local(
    defs: &[(usize, u32, String)],
    at: usize,
    n: u32,
    dir: LocalDir,
    span: Span,
) -> Result<String, AsmError> {
    let found = match dir {
        LocalDir::Back => defs.iter().rev().find(|(i, m, _)| *i < at && *m == n),
        LocalDir::Fwd => defs.iter().find(|(i, m, _)| *i > at && *m == n),
    };
    found.map(|(_, _, name)| name.clone()).ok_or_else(|| {
        let which = match dir {
            LocalDir::Back => "backward",
            LocalDir::Fwd => "forward",
        };
        AsmError::symbol(
            format!("no {} definition of numeric label {}", which, n),
            span,
        )
    })
}

fn rewrite_expr(
    e: &mut Expr,
    lookup: &impl Fn(u32, LocalDir) -> Result<String, AsmError>,
) -> Result<(), AsmError> {
    match e {
        Expr::LocalRef(n, dir) => {
            *e = Expr::Ident(lookup(*n, *dir)?);
        }
        Expr::Unary(_, inner) => rewrite_expr(inner, lookup)?,
        Expr::Binary(_, a, b) => {
            rewrite_expr(a, lookup)?;
            rewrite_expr(b, lookup)?;
        }
        _ => {}
    }
    Ok(())
}

fn rewrite_operand(
    op: &mut Operand,
    lookup: &impl Fn(u32, LocalDir) -> Result<String, AsmError>,
) -> Result<(), AsmError> {
    match op {
        Operand::Expr(e) | Operand::PtrDisp(_, e) => rewrite_expr(e, lookup),
        _ => Ok(()),
    }
}

// Numeric labels may repeat; a reference binds to the nearest matching
// definition in the given direction. Each definition becomes a synthetic
// dotted name, which no user identifier can collide with.
fn resolve_local_labels(mut items: Vec<ParsedItem>) -> Result<Vec<ParsedItem>, AsmError> {
    let mut defs: Vec<(usize, u32, String)> = Vec::new();
    for (idx, pi) in items.iter_mut().enumerate() {
        if let Item::NumericLabel(n) = pi.item {
            let synthetic = format!(".L{}.{}", n, defs.len());
            defs.push((idx, n, synthetic.clone()));
            pi.item = Item::Label(synthetic);
        }
    }
    for idx in 0..items.len() {
        let span = items[idx].span;
        let lookup = |n: u32, dir: LocalDir| lookup_local(&defs, idx, n, dir, span);
        match &mut items[idx].item {
            Item::Instruction { operands, .. } => {
                for op in operands {
                    rewrite_operand(op, &lookup)?;
                }
            }
            Item::Byte(args) => {
                for op in args {
                    rewrite_operand(op, &lookup)?;
                }
            }
            Item::Word(exprs) => {
                for e in exprs {
                    rewrite_expr(e, &lookup)?;
                }
            }
            Item::Equ { value, .. } | Item::Default { value, .. } => {
                rewrite_operand(value, &lookup)?;
            }
            _ => {}
        }
    }
    Ok(items)
}
