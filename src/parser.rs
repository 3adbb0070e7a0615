//! Token stream to datum.
//!
//! Recursive descent over the lexer's token stream, building one [`Value`]
//! per top-level form. All list structure is built from pairs and the empty
//! list; the parser never returns a native Rust sequence.
//!
//! The outcome of a parse distinguishes *incomplete* input (an open list, a
//! dangling quote, an unterminated string) from genuine errors, so an
//! interactive host can keep reading lines and re-parse. Lexer and parser
//! errors never touch the environment.

use crate::codes;
use crate::heap::Heap;
use crate::lexer::{Lexer, Token};
use crate::number::Number;
use crate::value::Value;
use crate::{LexError, ParseError};

/// Result of parsing one top-level form.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete datum.
    Complete(Value),
    /// The input ran out mid-form; the host should supply more input and
    /// re-parse.
    Incomplete,
    /// The input was exhausted cleanly with no datum started.
    Eof,
    /// A `#!name` directive at top level. `#!quit` tells the REPL to
    /// terminate.
    Directive(String),
    LexerError(LexError),
    ParserError(ParseError),
}

enum Interrupt {
    Incomplete,
    Lex(LexError),
    Parse(ParseError),
}

impl From<LexError> for Interrupt {
    fn from(e: LexError) -> Self {
        Interrupt::Lex(e)
    }
}

impl From<ParseError> for Interrupt {
    fn from(e: ParseError) -> Self {
        Interrupt::Parse(e)
    }
}

type PResult<T> = Result<T, Interrupt>;

pub struct DatumParser<'a> {
    lexer: &'a mut Lexer,
    heap: &'a mut Heap,
}

impl<'a> DatumParser<'a> {
    pub fn new(lexer: &'a mut Lexer, heap: &'a mut Heap) -> Self {
        DatumParser { lexer, heap }
    }

    /// Parse the next top-level form.
    pub fn parse(&mut self) -> ParseOutcome {
        let first = match self.lexer.get() {
            Ok(token) => token,
            Err(e) => return lex_outcome(e),
        };
        match first {
            Token::EndOfInput => ParseOutcome::Eof,
            Token::Directive(name) => ParseOutcome::Directive(name),
            // A commented-out datum before the real form, or before
            // nothing at all.
            Token::DatumComment => match self.datum() {
                Ok(_) => self.parse(),
                Err(interrupt) => interrupt_outcome(interrupt),
            },
            other => {
                self.lexer.unget(other);
                match self.datum() {
                    Ok(value) => ParseOutcome::Complete(value),
                    Err(interrupt) => interrupt_outcome(interrupt),
                }
            }
        }
    }

    fn next_token(&mut self) -> PResult<Token> {
        Ok(self.lexer.get()?)
    }

    fn datum(&mut self) -> PResult<Value> {
        let token = self.next_token()?;
        match token {
            Token::EndOfInput => Err(Interrupt::Incomplete),
            Token::ParenLeft => self.list_tail(),
            Token::VectorStart => self.vector_tail(),
            Token::BytevectorStart => self.bytevector_tail(),
            Token::Quote => self.abbreviation("quote"),
            Token::Backtick => self.abbreviation("quasiquote"),
            Token::Comma => self.abbreviation("unquote"),
            Token::CommaAt => self.abbreviation("unquote-splicing"),
            Token::DatumComment => {
                // Discard the next datum entirely, then parse the real one.
                self.datum()?;
                self.datum()
            }
            // A directive inside a datum is lexical noise.
            Token::Directive(_) => self.datum(),
            Token::Identifier(name) => Ok(Value::Symbol(name)),
            Token::BooleanTrue => Ok(Value::Boolean(true)),
            Token::BooleanFalse => Ok(Value::Boolean(false)),
            Token::Number(n) => Ok(Value::Number(n)),
            Token::String(s) => Ok(self.heap.string_value(s)),
            Token::Character(c) => Ok(Value::Character(c)),
            Token::Period => Err(ParseError::with_found(
                codes::PARSE_UNEXPECTED_DOT,
                "'.' is only valid inside a list",
                ".",
            )
            .into()),
            Token::ParenRight => Err(ParseError::with_found(
                codes::PARSE_UNEXPECTED_CLOSE,
                "unexpected ')'",
                ")",
            )
            .into()),
        }
    }

    /// The remainder of a list after its opening parenthesis: proper
    /// `(a b c)` or improper `(a b . c)`.
    fn list_tail(&mut self) -> PResult<Value> {
        let mut items = Vec::new();
        loop {
            let token = self.next_token()?;
            match token {
                Token::EndOfInput => return Err(Interrupt::Incomplete),
                Token::ParenRight => return Ok(self.heap.list_from(items)),
                Token::DatumComment => {
                    self.datum()?;
                }
                Token::Period => {
                    if items.is_empty() {
                        return Err(ParseError::with_found(
                            codes::PARSE_UNEXPECTED_DOT,
                            "'.' must follow at least one datum",
                            ".",
                        )
                        .into());
                    }
                    let tail = self.datum()?;
                    match self.next_token()? {
                        Token::ParenRight => return Ok(self.heap.improper_from(items, tail)),
                        Token::EndOfInput => return Err(Interrupt::Incomplete),
                        other => {
                            return Err(ParseError::with_found(
                                codes::PARSE_EXPECTED_CLOSE,
                                "expected ')' after dotted tail",
                                other.to_string(),
                            )
                            .into());
                        }
                    }
                }
                other => {
                    self.lexer.unget(other);
                    items.push(self.datum()?);
                }
            }
        }
    }

    fn vector_tail(&mut self) -> PResult<Value> {
        let mut items = Vec::new();
        loop {
            let token = self.next_token()?;
            match token {
                Token::EndOfInput => return Err(Interrupt::Incomplete),
                Token::ParenRight => return Ok(self.heap.vector_value(items)),
                Token::DatumComment => {
                    self.datum()?;
                }
                Token::Period => {
                    return Err(ParseError::with_found(
                        codes::PARSE_UNEXPECTED_DOT,
                        "'.' is not valid inside a vector",
                        ".",
                    )
                    .into());
                }
                other => {
                    self.lexer.unget(other);
                    items.push(self.datum()?);
                }
            }
        }
    }

    fn bytevector_tail(&mut self) -> PResult<Value> {
        let mut bytes = Vec::new();
        loop {
            let token = self.next_token()?;
            match token {
                Token::EndOfInput => return Err(Interrupt::Incomplete),
                Token::ParenRight => return Ok(self.heap.bytevector_value(bytes)),
                Token::Number(Number::Integer(byte)) if (0..=255).contains(&byte) => {
                    bytes.push(byte as u8);
                }
                other => {
                    return Err(ParseError::with_found(
                        codes::PARSE_BAD_BYTE,
                        "bytevector elements must be exact integers in 0..=255",
                        other.to_string(),
                    )
                    .into());
                }
            }
        }
    }

    /// `'d` and friends expand to `(quote d)` style two-element lists.
    fn abbreviation(&mut self, name: &str) -> PResult<Value> {
        let datum = self.datum()?;
        Ok(self.heap.list_from(vec![Value::symbol(name), datum]))
    }
}

fn lex_outcome(e: LexError) -> ParseOutcome {
    if e.starved {
        ParseOutcome::Incomplete
    } else {
        ParseOutcome::LexerError(e)
    }
}

fn interrupt_outcome(interrupt: Interrupt) -> ParseOutcome {
    match interrupt {
        Interrupt::Incomplete => ParseOutcome::Incomplete,
        Interrupt::Lex(e) => lex_outcome(e),
        Interrupt::Parse(e) => ParseOutcome::ParserError(e),
    }
}
