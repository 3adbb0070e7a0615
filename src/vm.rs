//! The heap-based virtual machine.
//!
//! Five registers: `acc` (the most recently computed value), `exp` (the
//! next instruction), `env` (the current environment), `rib` (evaluated
//! arguments for the pending call) and `frame` (the top of the control
//! stack). Each step decodes the head symbol of `exp` and performs that
//! instruction's effects; execution stops at `(halt)` with the program's
//! result in `acc`.
//!
//! Two properties fall out of the machine's shape:
//!
//! - **Proper tail calls.** Only the `frame` instruction pushes a call
//!   frame; `apply` never does. The compiler omits the `frame` wrapper for
//!   applications in tail position, so tail recursion runs in constant
//!   frame depth.
//! - **First-class continuations.** `conti` packages the current frame
//!   chain into a closure whose body is a `nuate` instruction. Frames are
//!   heap nodes, so the captured chain outlives its call and can be
//!   re-entered any number of times.
//!
//! The machine polls the heap's allocation watermark between instructions
//! and runs the cycle collector rooted at its registers, the frame chain
//! and the top-level environment.

use crate::RuntimeError;
use crate::env::EnvRef;
use crate::heap::{Heap, NodeBody, NodeRef};
use crate::value::{Formals, Rib, Value, list_ref};
use tracing::{debug, trace};

/// The variable a continuation closure binds its single argument to.
const CONT_VAR: &str = "kont_v000";

/// Counters from one program execution.
#[derive(Debug, Clone, Default)]
pub struct VmStats {
    pub steps: u64,
    pub max_frame_depth: usize,
    pub collections: usize,
}

pub struct Vm<'a> {
    heap: &'a mut Heap,
    global: EnvRef,
    acc: Value,
    exp: Value,
    env: EnvRef,
    rib: Rib,
    frame: Option<NodeRef>,
    depth: usize,
    stats: VmStats,
}

impl<'a> Vm<'a> {
    pub fn new(heap: &'a mut Heap, global: &EnvRef, code: Value) -> Self {
        Vm {
            heap,
            global: global.clone(),
            acc: Value::Unspecified,
            exp: code,
            env: global.clone(),
            rib: Rib::new(),
            frame: None,
            depth: 0,
            stats: VmStats::default(),
        }
    }

    /// Run to `(halt)`. The result is the accumulator at halt.
    pub fn run(mut self) -> Result<(Value, VmStats), RuntimeError> {
        loop {
            if self.heap.wants_collect() {
                self.collect_garbage();
            }
            self.stats.steps += 1;

            let instr = self.exp.clone();
            let op = opcode(&instr)?;
            trace!(step = self.stats.steps, op = %op, "dispatch");
            match op.as_str() {
                "halt" => {
                    debug!(
                        steps = self.stats.steps,
                        max_frame_depth = self.stats.max_frame_depth,
                        collections = self.stats.collections,
                        "execution halted"
                    );
                    return Ok((self.acc, self.stats));
                }
                "refer" => {
                    let var = symbol_operand(&instr, 1)?;
                    self.acc = self
                        .env
                        .lookup(&var)
                        .ok_or_else(|| RuntimeError::unbound_variable(&var))?;
                    self.exp = operand(&instr, 2)?;
                }
                "constant" => {
                    self.acc = operand(&instr, 1)?;
                    self.exp = operand(&instr, 2)?;
                }
                "close" => {
                    let formals_datum = operand(&instr, 1)?;
                    let body = operand(&instr, 2)?;
                    let formals = Formals::from_datum(&formals_datum).ok_or_else(|| {
                        RuntimeError::malformed_instruction(format!(
                            "close with malformed formals: {formals_datum}"
                        ))
                    })?;
                    self.acc = self.heap.closure(self.env.clone(), body, formals, None);
                    self.exp = operand(&instr, 3)?;
                }
                "test" => {
                    let then_code = operand(&instr, 1)?;
                    let else_code = operand(&instr, 2)?;
                    self.exp = if self.acc.is_false() { else_code } else { then_code };
                }
                "assign" => {
                    let var = symbol_operand(&instr, 1)?;
                    if !self.env.assign(&var, self.acc.clone()) {
                        return Err(RuntimeError::unbound_variable(&var));
                    }
                    self.exp = operand(&instr, 2)?;
                }
                "conti" => {
                    let next = operand(&instr, 1)?;
                    let frame_datum = match &self.frame {
                        Some(node) => Value::Frame(node.clone()),
                        None => Value::Null,
                    };
                    let nuate_body = self.heap.list_from(vec![
                        Value::symbol("nuate"),
                        frame_datum,
                        Value::symbol(CONT_VAR),
                    ]);
                    let empty_env = EnvRef::new(self.heap, None);
                    let formals = Formals::Fixed(vec![CONT_VAR.to_owned()]);
                    self.acc = self
                        .heap
                        .closure(empty_env, nuate_body, formals, self.frame.clone());
                    self.exp = next;
                }
                "nuate" => {
                    let frame_datum = operand(&instr, 1)?;
                    let var = symbol_operand(&instr, 2)?;
                    self.acc = self
                        .env
                        .lookup(&var)
                        .ok_or_else(|| RuntimeError::unbound_variable(&var))?;
                    self.frame = match frame_datum {
                        Value::Frame(node) => Some(node),
                        Value::Null => None,
                        other => {
                            return Err(RuntimeError::malformed_instruction(format!(
                                "nuate with a non-frame operand: {other}"
                            )));
                        }
                    };
                    self.depth = chain_depth(&self.frame);
                    self.exp = self.heap.list_from(vec![Value::symbol("return")]);
                }
                "frame" => {
                    let code = operand(&instr, 1)?;
                    let ret = operand(&instr, 2)?;
                    let rib = std::mem::take(&mut self.rib);
                    let pushed =
                        self.heap
                            .frame(ret, self.env.clone(), rib, self.frame.take());
                    self.frame = Some(pushed);
                    self.depth += 1;
                    self.stats.max_frame_depth = self.stats.max_frame_depth.max(self.depth);
                    self.exp = code;
                }
                "argument" => {
                    self.rib.push(self.acc.clone());
                    self.exp = operand(&instr, 1)?;
                }
                "apply" => self.do_apply()?,
                "return" => self.do_return()?,
                other => {
                    return Err(RuntimeError::malformed_instruction(format!(
                        "unknown instruction '{other}'"
                    )));
                }
            }
        }
    }

    /// Invoke the callable in `acc` on the rib. Closures extend their
    /// captured environment and transfer control without pushing a frame;
    /// natives run immediately and behave as an implicit `return`.
    fn do_apply(&mut self) -> Result<(), RuntimeError> {
        match self.acc.clone() {
            Value::Closure(node) => {
                let (closure_env, body, formals) = closure_parts(&node).ok_or_else(|| {
                    RuntimeError::malformed_instruction("apply of a reclaimed closure")
                })?;
                let call_env = closure_env.new_child(self.heap);
                match formals {
                    Formals::Fixed(params) => {
                        if self.rib.len() != params.len() {
                            return Err(RuntimeError::arity(
                                "apply",
                                params.len(),
                                self.rib.len(),
                            ));
                        }
                        for (param, arg) in params.iter().zip(self.rib.iter()) {
                            call_env.define(param, arg.clone());
                        }
                    }
                    Formals::Rest(params, rest) => {
                        if self.rib.len() < params.len() {
                            return Err(RuntimeError::arity(
                                "apply",
                                format!("at least {}", params.len()),
                                self.rib.len(),
                            ));
                        }
                        for (param, arg) in params.iter().zip(self.rib.iter()) {
                            call_env.define(param, arg.clone());
                        }
                        let rest_args = self.rib[params.len()..].to_vec();
                        let rest_list = self.heap.list_from(rest_args);
                        call_env.define(&rest, rest_list);
                    }
                }
                self.env = call_env;
                self.exp = body;
                self.rib.clear();
                Ok(())
            }
            Value::Native(op) => {
                op.arity.validate(op.name, self.rib.len())?;
                self.acc = (op.run)(self.heap, &self.rib)?;
                self.do_return()
            }
            other => Err(RuntimeError::not_applicable(other.type_name())),
        }
    }

    /// Pop the top call frame, restoring the caller's registers.
    fn do_return(&mut self) -> Result<(), RuntimeError> {
        let top = self
            .frame
            .take()
            .ok_or_else(RuntimeError::empty_control_stack)?;
        let (ret, env, rib, next) = frame_parts(&top).ok_or_else(|| {
            RuntimeError::malformed_instruction("return through a reclaimed frame")
        })?;
        self.exp = ret;
        self.env = env;
        self.rib = rib;
        self.frame = next;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    fn collect_garbage(&mut self) {
        let mut gc = self.heap.collector();
        gc.mark_value(&self.acc);
        gc.mark_value(&self.exp);
        for value in &self.rib {
            gc.mark_value(value);
        }
        gc.mark_node(self.env.node());
        gc.mark_node(self.global.node());
        if let Some(frame) = &self.frame {
            gc.mark_node(frame);
        }
        gc.finish();
        self.stats.collections += 1;
    }
}

fn opcode(instr: &Value) -> Result<String, RuntimeError> {
    match instr.car() {
        Some(Value::Symbol(op)) => Ok(op),
        _ => Err(RuntimeError::malformed_instruction(format!(
            "not an instruction: {instr}"
        ))),
    }
}

fn operand(instr: &Value, index: usize) -> Result<Value, RuntimeError> {
    list_ref(instr, index).ok_or_else(|| {
        RuntimeError::malformed_instruction(format!(
            "instruction missing operand {index}: {instr}"
        ))
    })
}

fn symbol_operand(instr: &Value, index: usize) -> Result<String, RuntimeError> {
    match operand(instr, index)? {
        Value::Symbol(name) => Ok(name),
        other => Err(RuntimeError::malformed_instruction(format!(
            "expected a symbol operand, got {other}"
        ))),
    }
}

fn closure_parts(node: &NodeRef) -> Option<(EnvRef, Value, Formals)> {
    match &*node.body.borrow() {
        NodeBody::Closure(closure) => Some((
            closure.env.clone(),
            closure.body.clone(),
            closure.formals.clone(),
        )),
        _ => None,
    }
}

fn frame_parts(node: &NodeRef) -> Option<(Value, EnvRef, Rib, Option<NodeRef>)> {
    match &*node.body.borrow() {
        NodeBody::Frame(frame) => Some((
            frame.ret.clone(),
            frame.env.clone(),
            frame.rib.clone(),
            frame.next.clone(),
        )),
        _ => None,
    }
}

fn chain_depth(frame: &Option<NodeRef>) -> usize {
    let mut depth = 0;
    let mut cursor = frame.clone();
    while let Some(node) = cursor {
        depth += 1;
        cursor = match &*node.body.borrow() {
            NodeBody::Frame(frame) => frame.next.clone(),
            _ => None,
        };
    }
    depth
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::builtins;
    use crate::codes;
    use crate::compiler::Compiler;
    use crate::lexer::Lexer;
    use crate::number::Number;
    use crate::parser::{DatumParser, ParseOutcome};

    /// Parse, compile and execute every form in `source` on one machine
    /// state, returning the last result and its execution stats.
    fn run_source(source: &str) -> Result<(Value, VmStats), RuntimeError> {
        let mut heap = Heap::new();
        let env = EnvRef::new(&mut heap, None);
        builtins::install(&mut heap, &env);

        let mut lexer = Lexer::new(source);
        let mut last = (Value::Unspecified, VmStats::default());
        loop {
            let outcome = DatumParser::new(&mut lexer, &mut heap).parse();
            match outcome {
                ParseOutcome::Complete(datum) => {
                    let code = Compiler::new(&mut heap, env.clone())
                        .compile(&datum)
                        .unwrap_or_else(|e| panic!("compile failed: {e}"));
                    heap.protect(code.clone());
                    let result = Vm::new(&mut heap, &env, code).run();
                    heap.unprotect();
                    last = result?;
                }
                ParseOutcome::Eof => return Ok(last),
                other => panic!("test source did not parse: {other:?}"),
            }
        }
    }

    fn int(i: i64) -> Value {
        Value::Number(Number::Integer(i))
    }

    #[test]
    fn test_literal_halts_with_value() {
        let (result, stats) = run_source("42").unwrap();
        assert!(crate::value::eqv(&result, &int(42)));
        assert_eq!(stats.max_frame_depth, 0);
    }

    #[test]
    fn test_application_restores_caller_state() {
        let (result, _) = run_source("(+ (* 2 3) (- 10 4))").unwrap();
        assert!(crate::value::eqv(&result, &int(12)));
    }

    #[test]
    fn test_closure_capture_and_shadowing() {
        let (result, _) = run_source(
            "(define make-adder (lambda (x) (lambda (y) (+ x y))))
             ((make-adder 10) 5)",
        )
        .unwrap();
        assert!(crate::value::eqv(&result, &int(15)));
    }

    #[test]
    fn test_rest_parameters() {
        let (result, _) = run_source("((lambda args args) 1 2 3)").unwrap();
        assert_eq!(format!("{result}"), "(1 2 3)");

        let (result, _) = run_source("((lambda (a . rest) rest) 1 2 3)").unwrap();
        assert_eq!(format!("{result}"), "(2 3)");

        let (result, _) = run_source("((lambda (a . rest) rest) 1)").unwrap();
        assert!(matches!(result, Value::Null));
    }

    #[test]
    fn test_set_mutates_captured_environment() {
        let (result, _) = run_source(
            "(define counter 0)
             (define bump (lambda () (set! counter (+ counter 1)) counter))
             (bump)
             (bump)
             (bump)",
        )
        .unwrap();
        assert!(crate::value::eqv(&result, &int(3)));
    }

    #[test]
    fn test_tail_recursion_runs_in_constant_frame_depth() {
        let (result, stats) = run_source(
            "(define loop (lambda (n) (if (= n 0) 'done (loop (- n 1)))))
             (loop 100000)",
        )
        .unwrap();
        assert!(matches!(result, Value::Symbol(ref s) if s == "done"));
        // The recursive call reuses its frame; only argument evaluation
        // pushes, so the chain stays shallow no matter the iteration count.
        assert!(
            stats.max_frame_depth <= 4,
            "frame depth grew: {}",
            stats.max_frame_depth
        );
    }

    #[test]
    fn test_call_cc_escape() {
        let (result, _) = run_source("(+ 1 (call/cc (lambda (k) (k 41))))").unwrap();
        assert!(crate::value::eqv(&result, &int(42)));

        // Ignoring the continuation is equivalent to a plain call.
        let (result, _) = run_source("(+ 1 (call/cc (lambda (k) 41)))").unwrap();
        assert!(crate::value::eqv(&result, &int(42)));
    }

    #[test]
    fn test_continuation_stored_and_reentered() {
        // Invoking a stored continuation re-enters the captured addition
        // context, so each later invocation yields 1 + n again.
        let (result, _) = run_source(
            "(define saved #f)
             (+ 1 (call/cc (lambda (k) (set! saved k) 10)))
             (saved 100)",
        )
        .unwrap();
        assert!(crate::value::eqv(&result, &int(101)));

        let (result, _) = run_source(
            "(define saved #f)
             (+ 1 (call/cc (lambda (k) (set! saved k) 10)))
             (saved 50)
             (saved 1000)",
        )
        .unwrap();
        assert!(crate::value::eqv(&result, &int(1001)));
    }

    #[test]
    fn test_runtime_errors() {
        let cases = vec![
            ("nowhere", codes::RUNTIME_UNBOUND_VARIABLE),
            ("(set! nowhere 1)", codes::RUNTIME_UNBOUND_VARIABLE),
            ("(1 2)", codes::RUNTIME_NOT_APPLICABLE),
            ("(\"not a procedure\")", codes::RUNTIME_NOT_APPLICABLE),
            ("((lambda (x) x) 1 2)", codes::RUNTIME_ARITY),
            ("((lambda (x y) x) 1)", codes::RUNTIME_ARITY),
            ("(car 1 2)", codes::RUNTIME_ARITY),
            ("(/ 1 0)", codes::RUNTIME_DIVIDE_BY_ZERO),
        ];
        for (i, (source, expected)) in cases.into_iter().enumerate() {
            match run_source(source) {
                Err(e) => assert_eq!(e.code, expected, "case #{} ({source}): {e}", i + 1),
                Ok((v, _)) => panic!("case #{} ({source}): expected error, got {v}", i + 1),
            }
        }
    }

    #[test]
    fn test_collector_runs_during_execution() {
        let mut heap = Heap::with_threshold(64);
        let env = EnvRef::new(&mut heap, None);
        builtins::install(&mut heap, &env);

        let mut lexer = Lexer::new(
            "(define churn (lambda (n) (if (= n 0) 'ok (churn (- n 1)))))
             (churn 2000)",
        );
        let mut stats = VmStats::default();
        loop {
            match DatumParser::new(&mut lexer, &mut heap).parse() {
                ParseOutcome::Complete(datum) => {
                    let code = Compiler::new(&mut heap, env.clone()).compile(&datum).unwrap();
                    heap.protect(code.clone());
                    let (_, s) = Vm::new(&mut heap, &env, code).run().unwrap();
                    heap.unprotect();
                    stats = s;
                }
                ParseOutcome::Eof => break,
                other => panic!("parse failed: {other:?}"),
            }
        }
        // The loop churns environments and frames well past the watermark.
        assert!(stats.collections > 0, "collector never ran");
        // Definitions survive every collection.
        assert!(env.is_defined("churn"));
    }
}
