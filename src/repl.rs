//! The interactive loop.
//!
//! Input is accepted incrementally: when the parser reports `incomplete`,
//! the loop keeps the buffer, switches to a continuation prompt and reads
//! another line before re-parsing. Complete forms are compiled and run
//! immediately; their already-consumed text is dropped from the buffer so
//! a definition is never evaluated twice. The `#!quit` directive ends the
//! session.

use crate::interpreter::Interpreter;
use crate::lexer::Lexer;
use crate::parser::{DatumParser, ParseOutcome};
use crate::value::Value;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const HISTORY_FILE: &str = ".r7vm_history";

enum Feed {
    /// All complete forms were evaluated; `consumed` bytes can be dropped
    /// from the front of the buffer, the rest needs more input.
    NeedMore { consumed: usize },
    /// The buffer was fully consumed (or abandoned after an error).
    Done,
    Quit,
}

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("r7vm - an R7RS-small Scheme on a heap virtual machine");
    println!("Type #!quit or Ctrl+D to leave.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(HISTORY_FILE);

    let mut interp = Interpreter::new();
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { "r7vm> " } else { "  ..> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if buffer.is_empty() && line.trim().is_empty() {
                    continue;
                }
                if !line.trim().is_empty() {
                    let _ = rl.add_history_entry(line.trim_end());
                }
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                match feed(&mut interp, &buffer) {
                    Feed::NeedMore { consumed } => {
                        buffer.drain(..consumed);
                    }
                    Feed::Done => buffer.clear(),
                    Feed::Quit => break,
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("readline error: {err:?}");
                break;
            }
        }
    }

    let _ = rl.save_history(HISTORY_FILE);
    Ok(())
}

/// Evaluate every complete form currently in the buffer.
fn feed(interp: &mut Interpreter, buffer: &str) -> Feed {
    let mut lexer = Lexer::new(buffer);
    let mut consumed = 0;
    loop {
        let outcome = DatumParser::new(&mut lexer, interp.heap_mut()).parse();
        match outcome {
            ParseOutcome::Complete(datum) => {
                consumed = lexer.offset();
                match interp.eval_datum(&datum) {
                    Ok(value) => {
                        if !matches!(value, Value::Unspecified) {
                            println!("{value}");
                        }
                    }
                    Err(e) => {
                        // The rest of the buffer is abandoned; the
                        // top-level environment is untouched.
                        eprintln!("{e}");
                        return Feed::Done;
                    }
                }
            }
            ParseOutcome::Incomplete => return Feed::NeedMore { consumed },
            ParseOutcome::Eof => return Feed::Done,
            ParseOutcome::Directive(name) => {
                consumed = lexer.offset();
                if name == "quit" {
                    println!("Goodbye!");
                    return Feed::Quit;
                }
                // Other directives are accepted and ignored.
            }
            ParseOutcome::LexerError(e) => {
                eprintln!("{e}");
                return Feed::Done;
            }
            ParseOutcome::ParserError(e) => {
                eprintln!("{e}");
                return Feed::Done;
            }
        }
    }
}
