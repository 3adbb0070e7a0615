//! Character stream to token stream.
//!
//! The lexer owns a growable input buffer (an interactive host appends
//! lines to it) and a double-ended token queue that gives the parser
//! one-token backtracking through [`Lexer::get`], [`Lexer::peek`] and
//! [`Lexer::unget`].
//!
//! Token recognition mixes `nom` combinators for the regular shapes
//! (identifiers, numbers, directives) with hand-rolled character loops for
//! the stateful ones (string escapes, character literals, nested block
//! comments). Whitespace, line comments and block comments are consumed
//! silently; everything else becomes a [`Token`].
//!
//! Errors carry stable 20000-band codes. An error produced by running out
//! of input mid-token is flagged as *starved* so the parser can report
//! `incomplete` instead of failing.

use crate::LexError;
use crate::codes;
use crate::number::Number;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, one_of, satisfy},
    combinator::{opt, recognize},
    sequence::pair,
};
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    ParenLeft,
    ParenRight,
    /// `#(`
    VectorStart,
    /// `#u8(`
    BytevectorStart,
    Quote,
    Backtick,
    Comma,
    CommaAt,
    Period,
    Identifier(String),
    BooleanTrue,
    BooleanFalse,
    Number(Number),
    String(String),
    Character(char),
    /// `#!name`
    Directive(String),
    /// `#;`
    DatumComment,
    EndOfInput,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::ParenLeft => write!(f, "("),
            Token::ParenRight => write!(f, ")"),
            Token::VectorStart => write!(f, "#("),
            Token::BytevectorStart => write!(f, "#u8("),
            Token::Quote => write!(f, "'"),
            Token::Backtick => write!(f, "`"),
            Token::Comma => write!(f, ","),
            Token::CommaAt => write!(f, ",@"),
            Token::Period => write!(f, "."),
            Token::Identifier(name) => write!(f, "{name}"),
            Token::BooleanTrue => write!(f, "#t"),
            Token::BooleanFalse => write!(f, "#f"),
            Token::Number(n) => write!(f, "{n}"),
            Token::String(s) => write!(f, "\"{s}\""),
            Token::Character(c) => write!(f, "#\\{c}"),
            Token::Directive(name) => write!(f, "#!{name}"),
            Token::DatumComment => write!(f, "#;"),
            Token::EndOfInput => write!(f, "end of input"),
        }
    }
}

// R7RS identifier character classes, ASCII range.
fn is_initial(c: char) -> bool {
    c.is_ascii_alphabetic() || "!$%&*/:<=>?^_~".contains(c)
}

fn is_subsequent(c: char) -> bool {
    is_initial(c) || c.is_ascii_digit() || matches!(c, '.' | '@' | '+' | '-')
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | '|')
}

/// Delimiter requirement after self-delimiting tokens: end of input or a
/// delimiter character.
fn at_delimiter(rest: &str) -> bool {
    rest.chars().next().is_none_or(is_delimiter)
}

fn ident_body(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_initial), take_while(is_subsequent))).parse(input)
}

fn digits1(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_digit()).parse(input)
}

fn number_body(input: &str) -> IResult<&str, &str> {
    recognize((
        opt(one_of("+-")),
        alt((
            recognize((digits1, opt((char('.'), take_while(|c: char| c.is_ascii_digit()))))),
            recognize((char('.'), digits1)),
        )),
        opt((char('/'), digits1)),
    ))
    .parse(input)
}

fn directive_name(input: &str) -> IResult<&str, &str> {
    take_while1(is_subsequent).parse(input)
}

fn mnemonic_escape(c: char) -> Option<char> {
    match c {
        'a' => Some('\x07'),
        'b' => Some('\x08'),
        't' => Some('\t'),
        'n' => Some('\n'),
        'r' => Some('\r'),
        _ => None,
    }
}

fn named_character(name: &str) -> Option<char> {
    match name {
        "alarm" => Some('\x07'),
        "backspace" => Some('\x08'),
        "delete" => Some('\x7f'),
        "escape" => Some('\x1b'),
        "newline" => Some('\n'),
        "null" => Some('\0'),
        "return" => Some('\r'),
        "space" => Some(' '),
        "tab" => Some('\t'),
        _ => None,
    }
}

fn hex_char(digits: &str) -> Option<char> {
    u32::from_str_radix(digits, 16).ok().and_then(char::from_u32)
}

/// Byte-position cursor for the hand-rolled scanners.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    /// Look ahead at a run without consuming it.
    fn peek_while(&self, pred: impl Fn(char) -> bool) -> String {
        self.text[self.pos..].chars().take_while(|c| pred(*c)).collect()
    }

    /// Advance past `run`, which must have just come from `peek_while`.
    fn skip(&mut self, run: &str) {
        self.pos += run.len();
    }
}

pub struct Lexer {
    input: String,
    pos: usize,
    pending: VecDeque<Token>,
}

impl Lexer {
    pub fn new(input: impl Into<String>) -> Self {
        Lexer {
            input: input.into(),
            pos: 0,
            pending: VecDeque::new(),
        }
    }

    /// Append more source text, typically a continuation line from the
    /// REPL after an `incomplete` parse.
    pub fn append_input(&mut self, more: &str) {
        self.input.push_str(more);
    }

    /// Byte offset of the next unread character. Only meaningful while the
    /// backtracking queue is empty, e.g. right after a complete datum.
    pub fn offset(&self) -> usize {
        debug_assert!(self.pending.is_empty());
        self.pos
    }

    /// Consume and return the next token.
    pub fn get(&mut self) -> Result<Token, LexError> {
        match self.pending.pop_front() {
            Some(token) => Ok(token),
            None => self.scan_token(),
        }
    }

    /// Return the next token without consuming it.
    pub fn peek(&mut self) -> Result<Token, LexError> {
        if self.pending.is_empty() {
            let token = self.scan_token()?;
            self.pending.push_back(token);
        }
        Ok(self.pending[0].clone())
    }

    /// Push a token back onto the front of the queue.
    pub fn unget(&mut self, token: Token) {
        self.pending.push_front(token);
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    /// Skip whitespace, line comments and (possibly nested) block comments.
    fn skip_atmosphere(&mut self) -> Result<(), LexError> {
        loop {
            let rest = self.rest();
            let Some(c) = rest.chars().next() else {
                return Ok(());
            };
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else if c == ';' {
                let line_len = rest.find('\n').map_or(rest.len(), |i| i + 1);
                self.pos += line_len;
            } else if rest.starts_with("#|") {
                self.pos += skip_block_comment(rest)?;
            } else {
                return Ok(());
            }
        }
    }

    fn scan_token(&mut self) -> Result<Token, LexError> {
        self.skip_atmosphere()?;
        let rest = self.rest();
        let Some(c) = rest.chars().next() else {
            return Ok(Token::EndOfInput);
        };

        let (token, consumed) = match c {
            '(' => (Token::ParenLeft, 1),
            ')' => (Token::ParenRight, 1),
            '\'' => (Token::Quote, 1),
            '`' => (Token::Backtick, 1),
            ',' => {
                if rest[1..].starts_with('@') {
                    (Token::CommaAt, 2)
                } else {
                    (Token::Comma, 1)
                }
            }
            '"' => scan_string(rest)?,
            '|' => scan_pipe_identifier(rest)?,
            '#' => scan_hash(rest)?,
            '.' => scan_dot(rest)?,
            '+' | '-' => scan_sign(rest)?,
            c if c.is_ascii_digit() => scan_number(rest)?,
            c if is_initial(c) => match ident_body(rest) {
                Ok((remaining, name)) => (Token::Identifier(name.to_owned()), rest.len() - remaining.len()),
                Err(_) => {
                    return Err(LexError::new(
                        codes::LEX_INVALID_CHARACTER,
                        format!("invalid token starting with '{c}'"),
                    ));
                }
            },
            c => {
                return Err(LexError::new(
                    codes::LEX_INVALID_CHARACTER,
                    format!("invalid character '{c}'"),
                ));
            }
        };
        self.pos += consumed;
        Ok(token)
    }
}

fn skip_block_comment(rest: &str) -> Result<usize, LexError> {
    // rest starts with "#|"; nesting is tracked by depth.
    let mut pos = 2;
    let mut depth = 1;
    while pos < rest.len() {
        if rest[pos..].starts_with("#|") {
            depth += 1;
            pos += 2;
        } else if rest[pos..].starts_with("|#") {
            depth -= 1;
            pos += 2;
            if depth == 0 {
                return Ok(pos);
            }
        } else if let Some(c) = rest[pos..].chars().next() {
            pos += c.len_utf8();
        }
    }
    Err(LexError::starved(
        codes::LEX_UNTERMINATED_BLOCK_COMMENT,
        "unterminated block comment",
    ))
}

fn scan_number(rest: &str) -> Result<(Token, usize), LexError> {
    let (remaining, text) = number_body(rest).map_err(|_| {
        LexError::new(codes::LEX_MALFORMED_NUMBER, "malformed number literal")
    })?;
    if !at_delimiter(remaining) {
        return Err(LexError::new(
            codes::LEX_MALFORMED_NUMBER,
            format!("number literal '{text}' not followed by a delimiter"),
        ));
    }
    match Number::parse(text) {
        Some(number) => Ok((Token::Number(number), rest.len() - remaining.len())),
        None => Err(LexError::new(
            codes::LEX_MALFORMED_NUMBER,
            format!("malformed number literal '{text}'"),
        )),
    }
}

fn scan_sign(rest: &str) -> Result<(Token, usize), LexError> {
    let mut chars = rest.chars();
    let sign = chars.next().unwrap_or('+');
    let second = chars.next();
    let third = chars.next();
    match second {
        None => Ok((Token::Identifier(sign.to_string()), 1)),
        Some(c) if c.is_ascii_digit() => scan_number(rest),
        Some('.') if third.is_some_and(|c| c.is_ascii_digit()) => scan_number(rest),
        Some(c) if is_delimiter(c) => Ok((Token::Identifier(sign.to_string()), 1)),
        Some(_) => {
            // Peculiar identifier: the sign followed by subsequents.
            let mut cursor = Cursor { text: rest, pos: 1 };
            let body = cursor.take_while(is_subsequent);
            if body.is_empty() {
                return Err(LexError::new(
                    codes::LEX_INVALID_CHARACTER,
                    format!("invalid token starting with '{sign}'"),
                ));
            }
            Ok((Token::Identifier(format!("{sign}{body}")), cursor.pos))
        }
    }
}

fn scan_dot(rest: &str) -> Result<(Token, usize), LexError> {
    match rest[1..].chars().next() {
        None => Ok((Token::Period, 1)),
        Some(c) if c.is_ascii_digit() => scan_number(rest),
        Some(c) if is_delimiter(c) => Ok((Token::Period, 1)),
        Some(c) if is_subsequent(c) => {
            let mut cursor = Cursor { text: rest, pos: 1 };
            let body = cursor.take_while(is_subsequent);
            Ok((Token::Identifier(format!(".{body}")), cursor.pos))
        }
        Some(c) => Err(LexError::new(
            codes::LEX_INVALID_CHARACTER,
            format!("invalid character '{c}' after '.'"),
        )),
    }
}

fn scan_string(rest: &str) -> Result<(Token, usize), LexError> {
    let mut cursor = Cursor { text: rest, pos: 1 };
    let mut out = String::new();
    loop {
        match cursor.bump() {
            None => {
                return Err(LexError::starved(
                    codes::LEX_UNTERMINATED_STRING,
                    "unterminated string literal",
                ));
            }
            Some('"') => return Ok((Token::String(out), cursor.pos)),
            Some('\\') => scan_string_escape(&mut cursor, &mut out)?,
            Some(c) => out.push(c),
        }
    }
}

fn scan_string_escape(cursor: &mut Cursor, out: &mut String) -> Result<(), LexError> {
    match cursor.peek() {
        None => Err(LexError::starved(
            codes::LEX_UNTERMINATED_STRING,
            "unterminated string literal",
        )),
        Some('"') => {
            cursor.bump();
            out.push('"');
            Ok(())
        }
        Some('\\') => {
            cursor.bump();
            out.push('\\');
            Ok(())
        }
        Some(c) if c.is_ascii_alphanumeric() => {
            // Look at the whole alphanumeric run before deciding: a named
            // escape claims all of it, a mnemonic escape exactly one
            // letter, so `\newline` is one newline but `\nb` is a newline
            // followed by a literal b.
            let run = cursor.peek_while(|c| c.is_ascii_alphanumeric());
            if let Some(digits) = run.strip_prefix('x')
                && !digits.is_empty()
                && digits.chars().all(|c| c.is_ascii_hexdigit())
            {
                cursor.skip(&run);
                if !cursor.eat(';') {
                    return Err(LexError::new(
                        codes::LEX_UNTERMINATED_HEX_ESCAPE,
                        "inline hex escape missing terminating ';'",
                    ));
                }
                match hex_char(digits) {
                    Some(c) => {
                        out.push(c);
                        Ok(())
                    }
                    None => Err(LexError::new(
                        codes::LEX_BAD_HEX_SCALAR,
                        format!("\\x{digits}; is not a Unicode scalar value"),
                    )),
                }
            } else if let Some(named) = named_character(&run) {
                cursor.skip(&run);
                out.push(named);
                Ok(())
            } else if let Some(escaped) = mnemonic_escape(c) {
                cursor.bump();
                out.push(escaped);
                Ok(())
            } else if c == 'x' {
                // A bare `\x` with no hex digits is a literal x.
                cursor.bump();
                out.push('x');
                Ok(())
            } else {
                Err(LexError::new(
                    codes::LEX_BAD_STRING_ESCAPE,
                    format!("unknown string escape '\\{run}'"),
                ))
            }
        }
        Some(c) if c == ' ' || c == '\t' || c == '\n' || c == '\r' => {
            // Whitespace continuation: intraline whitespace, one newline,
            // then intraline whitespace, contributing nothing.
            cursor.take_while(|c| c == ' ' || c == '\t');
            let broke_line = if cursor.eat('\n') {
                true
            } else if cursor.eat('\r') {
                cursor.eat('\n');
                true
            } else {
                false
            };
            if !broke_line {
                return Err(LexError::new(
                    codes::LEX_BAD_STRING_ESCAPE,
                    "expected line break in string continuation escape",
                ));
            }
            cursor.take_while(|c| c == ' ' || c == '\t');
            Ok(())
        }
        Some(c) => Err(LexError::new(
            codes::LEX_BAD_STRING_ESCAPE,
            format!("unknown string escape '\\{c}'"),
        )),
    }
}

fn scan_pipe_identifier(rest: &str) -> Result<(Token, usize), LexError> {
    let mut cursor = Cursor { text: rest, pos: 1 };
    let mut out = String::new();
    loop {
        match cursor.bump() {
            None => {
                return Err(LexError::starved(
                    codes::LEX_UNTERMINATED_PIPE_IDENTIFIER,
                    "unterminated |...| identifier",
                ));
            }
            Some('|') => return Ok((Token::Identifier(out), cursor.pos)),
            Some('\\') => match cursor.bump() {
                None => {
                    return Err(LexError::starved(
                        codes::LEX_UNTERMINATED_PIPE_IDENTIFIER,
                        "unterminated |...| identifier",
                    ));
                }
                Some('|') => out.push('|'),
                Some('x') => {
                    let digits = cursor.take_while(|c| c.is_ascii_hexdigit());
                    if !cursor.eat(';') {
                        return Err(LexError::new(
                            codes::LEX_UNTERMINATED_HEX_ESCAPE,
                            "inline hex escape missing terminating ';'",
                        ));
                    }
                    match hex_char(&digits) {
                        Some(c) => out.push(c),
                        None => {
                            return Err(LexError::new(
                                codes::LEX_BAD_HEX_SCALAR,
                                format!("\\x{digits}; is not a Unicode scalar value"),
                            ));
                        }
                    }
                }
                Some(c) => match mnemonic_escape(c) {
                    Some(escaped) => out.push(escaped),
                    None => {
                        return Err(LexError::new(
                            codes::LEX_BAD_PIPE_ESCAPE,
                            format!("invalid escape '\\{c}' in |...| identifier"),
                        ));
                    }
                },
            },
            Some(c) => out.push(c),
        }
    }
}

fn scan_hash(rest: &str) -> Result<(Token, usize), LexError> {
    match rest[1..].chars().next() {
        None => Err(LexError::starved(
            codes::LEX_UNKNOWN_HASH,
            "end of input after '#'",
        )),
        Some('(') => Ok((Token::VectorStart, 2)),
        Some('u') => {
            if rest.len() < 4 && "#u8(".starts_with(rest) {
                Err(LexError::starved(
                    codes::LEX_BAD_BYTEVECTOR_PREFIX,
                    "end of input inside bytevector prefix",
                ))
            } else if rest.starts_with("#u8(") {
                Ok((Token::BytevectorStart, 4))
            } else {
                Err(LexError::new(
                    codes::LEX_BAD_BYTEVECTOR_PREFIX,
                    "invalid bytevector prefix, expected #u8(",
                ))
            }
        }
        Some('\\') => scan_character(rest),
        Some('t') | Some('f') => {
            let mut cursor = Cursor { text: rest, pos: 1 };
            let word = cursor.take_while(|c| c.is_ascii_alphabetic());
            let token = match word.as_str() {
                "t" | "true" => Token::BooleanTrue,
                "f" | "false" => Token::BooleanFalse,
                _ => {
                    let code = if word.starts_with('t') {
                        codes::LEX_BAD_BOOLEAN_TRUE
                    } else {
                        codes::LEX_BAD_BOOLEAN_FALSE
                    };
                    return Err(LexError::new(code, format!("invalid boolean '#{word}'")));
                }
            };
            if !at_delimiter(&rest[cursor.pos..]) {
                return Err(LexError::new(
                    codes::LEX_UNKNOWN_HASH,
                    format!("'#{word}' not followed by a delimiter"),
                ));
            }
            Ok((token, cursor.pos))
        }
        Some(';') => Ok((Token::DatumComment, 2)),
        Some('!') => {
            let after = &rest[2..];
            match directive_name(after) {
                Ok((remaining, name)) => {
                    Ok((Token::Directive(name.to_owned()), rest.len() - remaining.len()))
                }
                Err(_) => Err(LexError::new(
                    codes::LEX_UNKNOWN_HASH,
                    "expected identifier after '#!'",
                )),
            }
        }
        Some(c) => Err(LexError::new(
            codes::LEX_UNKNOWN_HASH,
            format!("unknown '#' prefix: '#{c}'"),
        )),
    }
}

fn scan_character(rest: &str) -> Result<(Token, usize), LexError> {
    // rest starts with "#\".
    let after = &rest[2..];
    let Some(first) = after.chars().next() else {
        return Err(LexError::starved(
            codes::LEX_BAD_CHARACTER,
            "end of input in character literal",
        ));
    };
    if !first.is_ascii_alphanumeric() {
        return Ok((Token::Character(first), 2 + first.len_utf8()));
    }
    let mut cursor = Cursor { text: after, pos: 0 };
    let run = cursor.take_while(|c| c.is_ascii_alphanumeric());
    let consumed = 2 + cursor.pos;
    if run.chars().count() == 1 {
        return Ok((Token::Character(first), consumed));
    }
    if let Some(digits) = run.strip_prefix('x')
        && digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return match hex_char(digits) {
            Some(c) => Ok((Token::Character(c), consumed)),
            None => Err(LexError::new(
                codes::LEX_BAD_HEX_SCALAR,
                format!("#\\x{digits} is not a Unicode scalar value"),
            )),
        };
    }
    match named_character(&run) {
        Some(c) => Ok((Token::Character(c), consumed)),
        None => Err(LexError::new(
            codes::LEX_BAD_CHARACTER,
            format!("unknown character name '#\\{run}'"),
        )),
    }
}
