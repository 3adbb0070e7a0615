//! The pipeline driver.
//!
//! An [`Interpreter`] owns one managed heap and one top-level environment
//! and runs source text through parse, compile and execute. Top-level
//! definitions persist across calls, which is what gives a REPL its
//! session state; lexer, parser and compile errors never touch the
//! environment, and runtime errors abort the program while leaving every
//! top-level binding intact.

use crate::compiler::Compiler;
use crate::env::EnvRef;
use crate::heap::Heap;
use crate::lexer::Lexer;
use crate::parser::{DatumParser, ParseOutcome};
use crate::value::Value;
use crate::vm::{Vm, VmStats};
use crate::{CompileError, Error, ParseError, RuntimeError, builtins, codes};

pub struct Interpreter {
    heap: Heap,
    global: EnvRef,
    last_stats: VmStats,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_heap(Heap::new())
    }

    /// An interpreter over a heap with a custom collection watermark.
    pub fn with_heap(mut heap: Heap) -> Self {
        let global = EnvRef::new(&mut heap, None);
        builtins::install(&mut heap, &global);
        Interpreter {
            heap,
            global,
            last_stats: VmStats::default(),
        }
    }

    pub fn global(&self) -> &EnvRef {
        &self.global
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Execution counters from the most recent [`Interpreter::execute`].
    pub fn last_stats(&self) -> &VmStats {
        &self.last_stats
    }

    pub fn compile_datum(&mut self, datum: &Value) -> Result<Value, CompileError> {
        Compiler::new(&mut self.heap, self.global.clone()).compile(datum)
    }

    pub fn execute(&mut self, code: Value) -> Result<Value, RuntimeError> {
        self.heap.protect(code.clone());
        let result = Vm::new(&mut self.heap, &self.global, code).run();
        self.heap.unprotect();
        let (value, stats) = result?;
        self.last_stats = stats;
        Ok(value)
    }

    /// Compile and run one datum.
    pub fn eval_datum(&mut self, datum: &Value) -> Result<Value, Error> {
        self.heap.protect(datum.clone());
        let compiled = self.compile_datum(datum);
        let result = match compiled {
            Ok(code) => self.execute(code).map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        self.heap.unprotect();
        result
    }

    /// Evaluate every form in `source`, returning the last result.
    ///
    /// Unlike the REPL, this treats incomplete input as an error: there is
    /// no one to ask for the rest.
    pub fn eval_source(&mut self, source: &str) -> Result<Value, Error> {
        let mut lexer = Lexer::new(source);
        let mut last = Value::Unspecified;
        loop {
            let outcome = DatumParser::new(&mut lexer, &mut self.heap).parse();
            match outcome {
                ParseOutcome::Complete(datum) => last = self.eval_datum(&datum)?,
                ParseOutcome::Eof => return Ok(last),
                ParseOutcome::Incomplete => {
                    return Err(ParseError::new(
                        codes::PARSE_UNEXPECTED_EOF,
                        "unexpected end of input",
                    )
                    .into());
                }
                ParseOutcome::Directive(_) => {}
                ParseOutcome::LexerError(e) => return Err(e.into()),
                ParseOutcome::ParserError(e) => return Err(e.into()),
            }
        }
    }

    /// Run a collection rooted at the top-level environment (and the
    /// protection stack). Used between programs; during execution the
    /// machine runs its own collections rooted at its registers.
    pub fn collect_now(&mut self) -> usize {
        let mut gc = self.heap.collector();
        gc.mark_node(self.global.node());
        gc.finish()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::heap::NodeBody;
    use crate::number::Number;
    use crate::value::{equal, eqv};

    fn int(i: i64) -> Value {
        Value::Number(Number::Integer(i))
    }

    /// End-to-end happy paths, one (source, written result) pair each.
    #[test]
    fn test_eval_source_scenarios() {
        let cases = vec![
            // Literals.
            ("42", "42"),
            ("#t", "#t"),
            ("\"hi\"", "\"hi\""),
            ("'sym", "sym"),
            ("'(1 2 3)", "(1 2 3)"),
            // Arithmetic.
            ("(+ 1 2 3)", "6"),
            ("(* 2 (+ 3 4))", "14"),
            ("(/ 1 3)", "1/3"),
            ("(- 10)", "-10"),
            // The numeric tower in action.
            ("(+ 9223372036854775807 1)", "9223372036854775808"),
            ("(* 1/2 4)", "2"),
            ("(+ 1/2 0.5)", "1.0"),
            // Closures and lexical capture.
            ("((lambda (x) x) 7)", "7"),
            ("(((lambda (x) (lambda (y) (+ x y))) 10) 5)", "15"),
            // Definitions persist and later forms see them.
            ("(define x 20) (+ x 2)", "22"),
            ("(define (twice f v) (f (f v))) (twice (lambda (n) (* n 3)) 2)", "18"),
            // set! mutates, define rebinds.
            ("(define y 1) (set! y 5) y", "5"),
            // Conditionals.
            ("(if (< 1 2) 'yes 'no)", "yes"),
            ("(if (> 1 2) 'yes 'no)", "no"),
            // Everything except #f is true.
            ("(if 0 'zero-is-true 'never)", "zero-is-true"),
            ("(if '() 'nil-is-true 'never)", "nil-is-true"),
            // begin sequences.
            ("(begin 1 2 3)", "3"),
            // Lists and vectors end to end.
            ("(car (cons 1 2))", "1"),
            ("(cdr '(1 2 3))", "(2 3)"),
            ("(append '(1 2) '(3))", "(1 2 3)"),
            ("(vector-ref (vector 'a 'b) 1)", "b"),
            ("(vector-ref #(10 20 30) 2)", "30"),
            ("(bytevector-u8-ref #u8(7 8) 0)", "7"),
            // Internal defines are letrec-style: mutually recursive.
            (
                "(define (parity n)
                   (define (even? k) (if (= k 0) #t (odd? (- k 1))))
                   (define (odd? k) (if (= k 0) #f (even? (- k 1))))
                   (if (even? n) 'even 'odd))
                 (parity 10)",
                "even",
            ),
            // call/cc: (call/cc (lambda (k) (k (f a)))) = (f a).
            ("(call/cc (lambda (k) (k (+ 2 3))))", "5"),
            ("(+ 1 (call/cc (lambda (k) (k 41))))", "42"),
        ];
        for (i, (source, expected)) in cases.into_iter().enumerate() {
            let mut interp = Interpreter::new();
            let result = interp
                .eval_source(source)
                .unwrap_or_else(|e| panic!("case #{} ({source}): {e}", i + 1));
            assert_eq!(
                format!("{result}"),
                expected,
                "case #{} ({source})",
                i + 1
            );
        }
    }

    #[test]
    fn test_definitions_persist_across_batches() {
        let mut interp = Interpreter::new();
        interp.eval_source("(define greeting \"hello\")").unwrap();
        let result = interp.eval_source("greeting").unwrap();
        assert_eq!(format!("{result}"), "\"hello\"");

        // A runtime error in a later batch leaves the binding intact.
        assert!(interp.eval_source("(car 5)").is_err());
        let result = interp.eval_source("greeting").unwrap();
        assert_eq!(format!("{result}"), "\"hello\"");
    }

    #[test]
    fn test_error_code_bands() {
        let mut interp = Interpreter::new();
        let cases = vec![
            ("\"bad \\q\"", 20000..21000),
            ("(1 . 2 3)", 30000..31000),
            ("(1 2", 30000..31000),
            ("(lambda (x x) x)", 40000..41000),
            ("(undefined-anywhere)", 50000..51000),
        ];
        for (source, band) in cases {
            let err = interp.eval_source(source).unwrap_err();
            assert!(
                band.contains(&err.code()),
                "{source}: code {} not in {band:?}",
                err.code()
            );
        }
    }

    #[test]
    fn test_tail_recursion_is_bounded() {
        let mut interp = Interpreter::new();
        let result = interp
            .eval_source(
                "(define loop (lambda (n) (if (= n 0) 'done (loop (- n 1)))))
                 (loop 100000)",
            )
            .unwrap();
        assert!(eqv(&result, &Value::symbol("done")));
        assert!(interp.last_stats().max_frame_depth <= 4);
    }

    #[test]
    fn test_continuation_survives_across_batches() {
        let mut interp = Interpreter::new();
        interp.eval_source("(define resume #f)").unwrap();
        let first = interp
            .eval_source("(+ 1 (call/cc (lambda (k) (set! resume k) 10)))")
            .unwrap();
        assert!(eqv(&first, &int(11)));

        // Invoking the stored continuation re-enters the captured addition.
        let second = interp.eval_source("(resume 41)").unwrap();
        assert!(eqv(&second, &int(42)));
        let third = interp.eval_source("(resume 100)").unwrap();
        assert!(eqv(&third, &int(101)));
    }

    #[test]
    fn test_equal_on_evaluated_structures() {
        let mut interp = Interpreter::new();
        let a = interp.eval_source("(list 1 (list 2 3) \"s\")").unwrap();
        let b = interp.eval_source("'(1 (2 3) \"s\")").unwrap();
        assert!(equal(&a, &b));
        assert!(!eqv(&a, &b));
    }

    #[test]
    fn test_gc_reclaims_unrooted_cycle() {
        let mut interp = Interpreter::new();

        // A self-referential pair with no roots survives refcounting but
        // not a collection.
        let pair = interp.heap_mut().cons(Value::Null, Value::Null);
        if let Value::Pair(node) = &pair {
            *node.body.borrow_mut() = NodeBody::Pair(pair.clone(), Value::Null);
        }
        let live_before = interp.heap().live_nodes();
        drop(pair);
        interp.collect_now();
        assert_eq!(interp.heap().live_nodes(), live_before - 1);
    }

    #[test]
    fn test_gc_preserves_reachable_top_level_data() {
        let mut interp = Interpreter::new();
        interp
            .eval_source("(define keep (list 1 2 3)) (define cell (cons 'a 'b))")
            .unwrap();
        interp.collect_now();
        interp.collect_now();

        // Everything reachable from the top level is still addressable.
        let result = interp.eval_source("(car keep)").unwrap();
        assert!(eqv(&result, &int(1)));
        let result = interp.eval_source("(cdr cell)").unwrap();
        assert!(eqv(&result, &Value::symbol("b")));
    }

    #[test]
    fn test_collection_during_long_run_with_small_watermark() {
        let mut interp = Interpreter::with_heap(Heap::with_threshold(128));
        let result = interp
            .eval_source(
                "(define sum (lambda (n acc) (if (= n 0) acc (sum (- n 1) (+ acc n)))))
                 (sum 5000 0)",
            )
            .unwrap();
        assert!(eqv(&result, &int(12502500)));
        assert!(interp.last_stats().collections > 0);
    }

    #[test]
    fn test_incomplete_source_is_an_error_outside_the_repl() {
        let mut interp = Interpreter::new();
        let err = interp.eval_source("(+ 1").unwrap_err();
        assert_eq!(err.code(), codes::PARSE_UNEXPECTED_EOF);
    }
}
