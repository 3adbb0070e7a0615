//! R7VM - An R7RS-small Scheme core on a heap-based virtual machine.
//!
//! This crate implements the execution pipeline of a small Scheme system:
//!
//! ```text
//! source text -> lexer -> token stream -> parser -> datum
//!             -> compiler -> instruction list -> virtual machine -> value
//! ```
//!
//! Every stage is threaded through one shared value representation: the
//! parser produces ordinary pair structure, the compiler emits its
//! instruction list *as* pair structure, and the virtual machine walks that
//! structure directly. A continuation is therefore nothing more than a pair
//! pointer plus a captured call-frame chain, which is what makes `call/cc`
//! cheap to support.
//!
//! ## Modules
//!
//! - `heap`: the managed heap - reference-counted nodes plus a mark pass
//!   that reclaims cycles
//! - `value`: the tagged `Value` union, `eqv?`/`equal?` and the printer
//! - `number`: the numeric tower (integer, big integer, rational, real)
//! - `env`: chained binding frames
//! - `lexer`: character stream to token stream, with backtracking
//! - `parser`: token stream to datum
//! - `compiler`: datum to instruction list
//! - `vm`: the five-register heap virtual machine
//! - `builtins`: the native procedure registry
//! - `interpreter`: the pipeline driver owning the heap and the top-level
//!   environment
//! - `repl`: the interactive loop
//!
//! ## Errors
//!
//! Each error family carries a numeric kind code that is stable across
//! releases: lexer errors in the 20000 band, parser errors in the 30000
//! band, compile errors in the 40000 band and runtime errors in the 50000
//! band. The textual description attached to a code is informative only.

use std::fmt;

/// Stable numeric kind codes for every error the pipeline can produce.
///
/// The code, not the message, is the contract: hosts may dispatch on the
/// code and must not parse the description.
pub mod codes {
    // Lexer band: 20000..=20999.
    pub const LEX_BAD_STRING_ESCAPE: u32 = 20002;
    pub const LEX_UNTERMINATED_STRING: u32 = 20003;
    pub const LEX_BAD_HEX_SCALAR: u32 = 20004;
    pub const LEX_BAD_BYTEVECTOR_PREFIX: u32 = 20007;
    pub const LEX_BAD_BOOLEAN_TRUE: u32 = 20008;
    pub const LEX_BAD_BOOLEAN_FALSE: u32 = 20009;
    pub const LEX_BAD_CHARACTER: u32 = 20010;
    pub const LEX_UNKNOWN_HASH: u32 = 20011;
    pub const LEX_UNTERMINATED_PIPE_IDENTIFIER: u32 = 20013;
    pub const LEX_INVALID_CHARACTER: u32 = 20016;
    pub const LEX_BAD_PIPE_ESCAPE: u32 = 20017;
    pub const LEX_UNTERMINATED_HEX_ESCAPE: u32 = 20018;
    pub const LEX_UNTERMINATED_BLOCK_COMMENT: u32 = 20019;
    pub const LEX_MALFORMED_NUMBER: u32 = 20020;

    // Parser band: 30000..=30999.
    pub const PARSE_UNEXPECTED_CLOSE: u32 = 30000;
    pub const PARSE_UNEXPECTED_DOT: u32 = 30001;
    pub const PARSE_EXPECTED_CLOSE: u32 = 30002;
    pub const PARSE_BAD_BYTE: u32 = 30003;
    pub const PARSE_UNEXPECTED_EOF: u32 = 30004;

    // Compiler band: 40000..=40999.
    pub const COMPILE_MALFORMED_FORM: u32 = 40000;
    pub const COMPILE_BAD_FORMALS: u32 = 40001;
    pub const COMPILE_DUPLICATE_FORMAL: u32 = 40002;
    pub const COMPILE_BAD_TARGET: u32 = 40003;
    pub const COMPILE_EMPTY_FORM: u32 = 40004;
    pub const COMPILE_MISPLACED_DEFINE: u32 = 40005;

    // Runtime band: 50000..=50999.
    pub const RUNTIME_UNBOUND_VARIABLE: u32 = 50000;
    pub const RUNTIME_ARITY: u32 = 50001;
    pub const RUNTIME_NOT_APPLICABLE: u32 = 50002;
    pub const RUNTIME_TYPE: u32 = 50003;
    pub const RUNTIME_RANGE: u32 = 50004;
    pub const RUNTIME_MALFORMED_INSTRUCTION: u32 = 50005;
    pub const RUNTIME_EMPTY_CONTROL_STACK: u32 = 50006;
    pub const RUNTIME_DIVIDE_BY_ZERO: u32 = 50007;
}

/// A malformed token in the input text.
///
/// `starved` records that the error was caused by running out of input in
/// the middle of a token (an unterminated string, say) rather than by a bad
/// character. The parser maps starved errors to its `Incomplete` outcome so
/// an interactive host can keep reading lines.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub code: u32,
    pub message: String,
    pub starved: bool,
}

impl LexError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        LexError {
            code,
            message: message.into(),
            starved: false,
        }
    }

    /// An error caused by end of input mid-token.
    pub fn starved(code: u32, message: impl Into<String>) -> Self {
        LexError {
            code,
            message: message.into(),
            starved: true,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lexer error {}: {}", self.code, self.message)
    }
}

/// A structurally invalid token sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub code: u32,
    pub message: String,
    /// The offending token's textual representation, if identifiable.
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        ParseError {
            code,
            message: message.into(),
            found: None,
        }
    }

    pub fn with_found(code: u32, message: impl Into<String>, found: impl Into<String>) -> Self {
        ParseError {
            code,
            message: message.into(),
            found: Some(found.into()),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "parser error {}: {}", self.code, self.message)?;
        if let Some(found) = &self.found {
            write!(f, " (found: {found})")?;
        }
        Ok(())
    }
}

/// A malformed special form discovered while lowering a datum.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub code: u32,
    pub message: String,
    /// Textual representation of the form being compiled.
    pub form: Option<String>,
}

impl CompileError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        CompileError {
            code,
            message: message.into(),
            form: None,
        }
    }

    pub fn with_form(code: u32, message: impl Into<String>, form: impl Into<String>) -> Self {
        CompileError {
            code,
            message: message.into(),
            form: Some(form.into()),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "compile error {}: {}", self.code, self.message)?;
        if let Some(form) = &self.form {
            write!(f, "\n  while compiling: {form}")?;
        }
        Ok(())
    }
}

/// An error raised during instruction execution.
///
/// Runtime errors abort the current program, unwind the frame chain and
/// leave the top-level environment untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub code: u32,
    pub message: String,
    /// Name of the failing operation, when one is known.
    pub operation: Option<String>,
}

impl RuntimeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        RuntimeError {
            code,
            message: message.into(),
            operation: None,
        }
    }

    pub fn in_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn unbound_variable(name: &str) -> Self {
        Self::new(
            codes::RUNTIME_UNBOUND_VARIABLE,
            format!("unbound variable: {name}"),
        )
    }

    pub fn arity(operation: &str, expected: impl fmt::Display, got: usize) -> Self {
        Self::new(
            codes::RUNTIME_ARITY,
            format!("expected {expected} arguments, got {got}"),
        )
        .in_operation(operation)
    }

    pub fn not_applicable(description: &str) -> Self {
        Self::new(
            codes::RUNTIME_NOT_APPLICABLE,
            format!("cannot apply non-procedure value: {description}"),
        )
    }

    pub fn type_error(operation: &str, message: impl Into<String>) -> Self {
        Self::new(codes::RUNTIME_TYPE, message).in_operation(operation)
    }

    pub fn range(operation: &str, message: impl Into<String>) -> Self {
        Self::new(codes::RUNTIME_RANGE, message).in_operation(operation)
    }

    pub fn malformed_instruction(message: impl Into<String>) -> Self {
        Self::new(codes::RUNTIME_MALFORMED_INSTRUCTION, message)
    }

    pub fn empty_control_stack() -> Self {
        Self::new(
            codes::RUNTIME_EMPTY_CONTROL_STACK,
            "return with no call frame on the control stack",
        )
    }

    pub fn divide_by_zero(operation: &str) -> Self {
        Self::new(codes::RUNTIME_DIVIDE_BY_ZERO, "division by zero").in_operation(operation)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.operation {
            Some(op) => write!(f, "runtime error {} in {}: {}", self.code, op, self.message),
            None => write!(f, "runtime error {}: {}", self.code, self.message),
        }
    }
}

/// Any error the pipeline can produce, from lexing through execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Lex(LexError),
    Parse(ParseError),
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl Error {
    /// The stable numeric kind code of the underlying error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Lex(e) => e.code,
            Error::Parse(e) => e.code,
            Error::Compile(e) => e.code,
            Error::Runtime(e) => e.code,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Lex(e) => write!(f, "{e}"),
            Error::Parse(e) => write!(f, "{e}"),
            Error::Compile(e) => write!(f, "{e}"),
            Error::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<LexError> for Error {
    fn from(e: LexError) -> Self {
        Error::Lex(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compile(e)
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

pub mod builtins;
pub mod compiler;
pub mod env;
pub mod heap;
pub mod interpreter;
pub mod lexer;
pub mod number;
pub mod parser;
pub mod repl;
pub mod value;
pub mod vm;

pub use heap::Heap;
pub use interpreter::Interpreter;
pub use number::Number;
pub use parser::{DatumParser, ParseOutcome};
pub use value::Value;
