//! Datum to instruction list.
//!
//! The compiler rewrites a source datum into the virtual machine's
//! instruction set, expressed as nested pairs in the value domain: every
//! instruction is a list whose head names the opcode and whose final
//! operand is the next instruction. There is no separate bytecode buffer,
//! which keeps continuations trivial - a captured program position is just
//! a pair pointer.
//!
//! Special forms are recognized by looking the head symbol up in the
//! compile-time (top-level) environment and checking whether it is bound to
//! a [`PrimitiveForm`] value. Rebinding `if` or `lambda` therefore shadows
//! the special form and the form compiles as an ordinary application.
//!
//! Applications whose continuation is `(return)` are in tail position and
//! compile without a `frame` wrapper, so tail calls reuse the caller's
//! frame and recursion depth is bounded by the heap, not the control stack.

use crate::CompileError;
use crate::codes;
use crate::env::EnvRef;
use crate::heap::Heap;
use crate::value::{Formals, PrimitiveForm, Value, list_elements};
use std::collections::HashSet;

pub struct Compiler<'a> {
    heap: &'a mut Heap,
    env: EnvRef,
    /// Names bound by enclosing lambda formals. A shadowed name never
    /// resolves to a special form.
    shadowed: Vec<Vec<String>>,
}

impl<'a> Compiler<'a> {
    /// `env` is the compile-time environment; at top level it is the same
    /// environment the program will run in, which is what lets `define`
    /// insert its binding during compilation.
    pub fn new(heap: &'a mut Heap, env: EnvRef) -> Self {
        Compiler {
            heap,
            env,
            shadowed: Vec::new(),
        }
    }

    /// Lower a datum to an instruction list ending in `(halt)`.
    pub fn compile(&mut self, datum: &Value) -> Result<Value, CompileError> {
        let halt = self.emit(vec![Value::symbol("halt")]);
        self.compile_expr(datum, halt, true)
    }

    fn emit(&mut self, items: Vec<Value>) -> Value {
        self.heap.list_from(items)
    }

    fn compile_expr(&mut self, datum: &Value, next: Value, top: bool) -> Result<Value, CompileError> {
        match datum {
            Value::Symbol(name) => {
                Ok(self.emit(vec![Value::symbol("refer"), Value::symbol(name), next]))
            }
            Value::Pair(_) => self.compile_form(datum, next, top),
            Value::Null => Err(CompileError::new(
                codes::COMPILE_EMPTY_FORM,
                "the empty combination () cannot be evaluated",
            )),
            literal => Ok(self.emit(vec![Value::symbol("constant"), literal.clone(), next])),
        }
    }

    /// Which special form, if any, the head of a combination denotes.
    fn resolve_form(&self, head: &Value) -> Option<PrimitiveForm> {
        match head {
            Value::PrimitiveForm(form) => Some(*form),
            Value::Symbol(name) => {
                if self.is_shadowed(name) {
                    return None;
                }
                match self.env.lookup(name) {
                    Some(Value::PrimitiveForm(form)) => Some(form),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn is_shadowed(&self, name: &str) -> bool {
        self.shadowed
            .iter()
            .any(|frame| frame.iter().any(|bound| bound == name))
    }

    fn compile_form(&mut self, datum: &Value, next: Value, top: bool) -> Result<Value, CompileError> {
        let head = datum.car().unwrap_or(Value::Null);
        let tail = datum.cdr().unwrap_or(Value::Null);
        let Some(args) = list_elements(&tail) else {
            return Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "combination is an improper list",
                format!("{datum}"),
            ));
        };

        match self.resolve_form(&head) {
            Some(PrimitiveForm::Quote) => self.compile_quote(datum, &args, next),
            Some(PrimitiveForm::Lambda) => self.compile_lambda(datum, &args, next),
            Some(PrimitiveForm::If) => self.compile_if(datum, &args, next),
            Some(PrimitiveForm::Set) => self.compile_set(datum, &args, next),
            Some(PrimitiveForm::Define) => self.compile_define(datum, &args, next, top),
            Some(PrimitiveForm::Begin) => {
                if args.is_empty() {
                    Ok(self.emit(vec![Value::symbol("constant"), Value::Unspecified, next]))
                } else {
                    self.compile_body(&args, next, top)
                }
            }
            Some(PrimitiveForm::CallCc) => self.compile_call_cc(datum, &args, next),
            None => self.compile_application(&head, &args, next),
        }
    }

    fn compile_quote(
        &mut self,
        datum: &Value,
        args: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        let [literal] = args else {
            return Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "quote takes exactly one datum",
                format!("{datum}"),
            ));
        };
        Ok(self.emit(vec![Value::symbol("constant"), literal.clone(), next]))
    }

    fn compile_lambda(
        &mut self,
        datum: &Value,
        args: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        let [formals_datum, body @ ..] = args else {
            return Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "lambda takes a formals list and a body",
                format!("{datum}"),
            ));
        };
        if body.is_empty() {
            return Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "lambda body must contain at least one expression",
                format!("{datum}"),
            ));
        }
        let Some(formals) = Formals::from_datum(formals_datum) else {
            return Err(CompileError::with_form(
                codes::COMPILE_BAD_FORMALS,
                "formals must be symbols, a symbol list, or a dotted symbol list",
                format!("{datum}"),
            ));
        };
        let mut seen = HashSet::new();
        for name in formals.names() {
            if !seen.insert(name.to_owned()) {
                return Err(CompileError::with_form(
                    codes::COMPILE_DUPLICATE_FORMAL,
                    format!("duplicate formal parameter '{name}'"),
                    format!("{datum}"),
                ));
            }
        }
        let ret = self.emit(vec![Value::symbol("return")]);
        self.shadowed
            .push(formals.names().iter().map(|s| (*s).to_owned()).collect());
        let body_result = self.compile_body(body, ret, false);
        self.shadowed.pop();
        Ok(self.emit(vec![
            Value::symbol("close"),
            formals_datum.clone(),
            body_result?,
            next,
        ]))
    }

    fn compile_if(
        &mut self,
        datum: &Value,
        args: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        let (test, then_branch, else_branch) = match args {
            [test, then_branch] => (test, then_branch, None),
            [test, then_branch, else_branch] => (test, then_branch, Some(else_branch)),
            _ => {
                return Err(CompileError::with_form(
                    codes::COMPILE_MALFORMED_FORM,
                    "if takes a test, a consequent, and an optional alternative",
                    format!("{datum}"),
                ));
            }
        };
        let else_code = match else_branch {
            Some(alt) => self.compile_expr(alt, next.clone(), false)?,
            None => self.emit(vec![Value::symbol("constant"), Value::Unspecified, next.clone()]),
        };
        let then_code = self.compile_expr(then_branch, next, false)?;
        let test_instruction = self.emit(vec![Value::symbol("test"), then_code, else_code]);
        self.compile_expr(test, test_instruction, false)
    }

    fn compile_set(
        &mut self,
        datum: &Value,
        args: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        let [target, expr] = args else {
            return Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "set! takes a variable and an expression",
                format!("{datum}"),
            ));
        };
        let Value::Symbol(name) = target else {
            return Err(CompileError::with_form(
                codes::COMPILE_BAD_TARGET,
                "set! target must be a symbol",
                format!("{datum}"),
            ));
        };
        let assign = self.emit(vec![Value::symbol("assign"), Value::symbol(name), next]);
        self.compile_expr(expr, assign, false)
    }

    /// Split a define form into its target name and value expression,
    /// expanding the `(define (f args) body)` procedure shorthand.
    fn define_parts(
        &mut self,
        datum: &Value,
        args: &[Value],
    ) -> Result<(String, Value), CompileError> {
        match args {
            [Value::Symbol(name), expr] => Ok((name.clone(), expr.clone())),
            [Value::Pair(_), body @ ..] if !body.is_empty() => {
                let header = &args[0];
                let name_datum = header.car().unwrap_or(Value::Null);
                let formals = header.cdr().unwrap_or(Value::Null);
                let Value::Symbol(name) = name_datum else {
                    return Err(CompileError::with_form(
                        codes::COMPILE_BAD_TARGET,
                        "define target must be a symbol",
                        format!("{datum}"),
                    ));
                };
                let mut items = vec![Value::PrimitiveForm(PrimitiveForm::Lambda), formals];
                items.extend(body.iter().cloned());
                let lambda = self.emit(items);
                Ok((name, lambda))
            }
            [_, _] => Err(CompileError::with_form(
                codes::COMPILE_BAD_TARGET,
                "define target must be a symbol",
                format!("{datum}"),
            )),
            _ => Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "define takes a name and an expression",
                format!("{datum}"),
            )),
        }
    }

    /// Top-level define: insert the binding into the compile-time (and
    /// runtime) environment now, then lower to an assignment. The
    /// expression's value is replaced by unspecified so a REPL does not
    /// echo definitions.
    fn compile_define(
        &mut self,
        datum: &Value,
        args: &[Value],
        next: Value,
        top: bool,
    ) -> Result<Value, CompileError> {
        if !top {
            return Err(CompileError::with_form(
                codes::COMPILE_MISPLACED_DEFINE,
                "define is only allowed at top level or at the head of a body",
                format!("{datum}"),
            ));
        }
        let (name, expr) = self.define_parts(datum, args)?;
        if !self.env.has_local(&name) {
            self.env.define(&name, Value::Unspecified);
        }
        let unspec = self.emit(vec![Value::symbol("constant"), Value::Unspecified, next]);
        let assign = self.emit(vec![Value::symbol("assign"), Value::symbol(&name), unspec]);
        self.compile_expr(&expr, assign, false)
    }

    fn compile_call_cc(
        &mut self,
        datum: &Value,
        args: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        let [receiver] = args else {
            return Err(CompileError::with_form(
                codes::COMPILE_MALFORMED_FORM,
                "call/cc takes exactly one procedure",
                format!("{datum}"),
            ));
        };
        let apply = self.emit(vec![Value::symbol("apply")]);
        let receiver_code = self.compile_expr(receiver, apply, false)?;
        let argument = self.emit(vec![Value::symbol("argument"), receiver_code]);
        let conti = self.emit(vec![Value::symbol("conti"), argument]);
        if is_tail(&next) {
            Ok(conti)
        } else {
            Ok(self.emit(vec![Value::symbol("frame"), conti, next]))
        }
    }

    /// `(f a1 .. an)`: arguments are compiled right to left, so at run time
    /// they evaluate left to right, each `argument` instruction appending
    /// the accumulator to the rib. In tail position no frame is pushed.
    fn compile_application(
        &mut self,
        head: &Value,
        args: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        let tail_call = is_tail(&next);
        let apply = self.emit(vec![Value::symbol("apply")]);
        let mut code = self.compile_expr(head, apply, false)?;
        for arg in args.iter().rev() {
            let argument = self.emit(vec![Value::symbol("argument"), code]);
            code = self.compile_expr(arg, argument, false)?;
        }
        if tail_call {
            Ok(code)
        } else {
            Ok(self.emit(vec![Value::symbol("frame"), code, next]))
        }
    }

    /// A body: internal defines at the head are letrec-style, then the
    /// remaining forms run in sequence with the last one's continuation
    /// being the caller's.
    fn compile_body(
        &mut self,
        forms: &[Value],
        next: Value,
        top: bool,
    ) -> Result<Value, CompileError> {
        if forms.is_empty() {
            return Err(CompileError::new(
                codes::COMPILE_MALFORMED_FORM,
                "body must contain at least one expression",
            ));
        }
        if !top {
            let mut defines = Vec::new();
            let mut rest_start = 0;
            for form in forms {
                if !self.is_define_form(form) {
                    break;
                }
                let args = list_elements(&form.cdr().unwrap_or(Value::Null)).ok_or_else(|| {
                    CompileError::with_form(
                        codes::COMPILE_MALFORMED_FORM,
                        "combination is an improper list",
                        format!("{form}"),
                    )
                })?;
                defines.push(self.define_parts(form, &args)?);
                rest_start += 1;
            }
            if !defines.is_empty() {
                return self.compile_letrec_body(&defines, &forms[rest_start..], next);
            }
        }

        let mut forms_rev = forms.iter().rev();
        let last = forms_rev.next().cloned().unwrap_or(Value::Unspecified);
        let mut code = self.compile_expr(&last, next, top)?;
        for form in forms_rev {
            code = self.compile_expr(form, code, top)?;
        }
        Ok(code)
    }

    fn is_define_form(&self, form: &Value) -> bool {
        matches!(form, Value::Pair(_))
            && form
                .car()
                .is_some_and(|head| self.resolve_form(&head) == Some(PrimitiveForm::Define))
    }

    /// Rewrite a body with leading internal defines into the equivalent
    /// letrec-style application:
    ///
    /// ```text
    /// (define v e) ... body
    ///   ==>  ((lambda (v ...) (set! v e) ... body) <unspecified> ...)
    /// ```
    ///
    /// binding every name first so the expressions can refer to each other.
    fn compile_letrec_body(
        &mut self,
        defines: &[(String, Value)],
        body: &[Value],
        next: Value,
    ) -> Result<Value, CompileError> {
        if body.is_empty() {
            return Err(CompileError::new(
                codes::COMPILE_MALFORMED_FORM,
                "body must end with an expression after its internal defines",
            ));
        }
        let formals: Vec<Value> = defines
            .iter()
            .map(|(name, _)| Value::symbol(name))
            .collect();
        let formals_datum = self.emit(formals);

        let mut lambda_items = vec![Value::PrimitiveForm(PrimitiveForm::Lambda), formals_datum];
        for (name, expr) in defines {
            let set_form = self.emit(vec![
                Value::PrimitiveForm(PrimitiveForm::Set),
                Value::symbol(name),
                expr.clone(),
            ]);
            lambda_items.push(set_form);
        }
        lambda_items.extend(body.iter().cloned());
        let lambda = self.emit(lambda_items);

        let mut app_items = vec![lambda];
        app_items.extend(std::iter::repeat_n(Value::Unspecified, defines.len()));
        let application = self.emit(app_items);
        self.compile_expr(&application, next, false)
    }
}

/// An expression whose continuation is `(return)` is in tail position.
fn is_tail(next: &Value) -> bool {
    matches!(next.car(), Some(Value::Symbol(ref op)) if op == "return")
}
