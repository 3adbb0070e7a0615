//! The native procedure registry.
//!
//! One static table defines every host-provided procedure: its Scheme
//! name, its arity contract, and the Rust function implementing it. The
//! table seeds the top-level environment with [`Value::Native`] bindings,
//! alongside the [`PrimitiveForm`] bindings the compiler recognizes.
//!
//! A native receives the evaluated value rib and the heap (so it can
//! allocate) and either returns a value or fails with a runtime error. The
//! virtual machine validates the arity contract before the call and treats
//! the invocation as an implicit `return`.

use crate::RuntimeError;
use crate::env::EnvRef;
use crate::heap::{Heap, NodeBody};
use crate::number::Number;
use crate::value::{PrimitiveForm, Value, equal, eqv, list_elements};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, RuntimeError>;

/// Expected argument count for a native procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Range(usize, usize),
    Any,
}

impl Arity {
    pub fn validate(&self, operation: &str, got: usize) -> Result<(), RuntimeError> {
        match self {
            Arity::Exact(n) => {
                if got == *n {
                    Ok(())
                } else {
                    Err(RuntimeError::arity(operation, n, got))
                }
            }
            Arity::AtLeast(n) => {
                if got >= *n {
                    Ok(())
                } else {
                    Err(RuntimeError::arity(operation, format!("at least {n}"), got))
                }
            }
            Arity::Range(lo, hi) => {
                if (*lo..=*hi).contains(&got) {
                    Ok(())
                } else {
                    Err(RuntimeError::arity(operation, format!("{lo} to {hi}"), got))
                }
            }
            Arity::Any => Ok(()),
        }
    }
}

/// One entry in the native registry.
pub struct NativeOp {
    pub name: &'static str,
    pub arity: Arity,
    pub run: NativeFn,
}

impl fmt::Debug for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NativeOp({})", self.name)
    }
}

/// Seed an environment with the primitive forms and the native registry.
/// Top-level defines added later persist alongside these bindings.
pub fn install(_heap: &mut Heap, env: &EnvRef) {
    for (name, form) in PRIMITIVE_FORMS {
        env.define(name, Value::PrimitiveForm(*form));
    }
    for op in NATIVE_OPS {
        env.define(op.name, Value::Native(op));
    }
}

pub fn find_native(name: &str) -> Option<&'static NativeOp> {
    NATIVE_INDEX.get(name).copied()
}

/// The compiler-recognized special forms, bound as first-class markers so
/// rebinding them degrades gracefully.
const PRIMITIVE_FORMS: &[(&str, PrimitiveForm)] = &[
    ("quote", PrimitiveForm::Quote),
    ("define", PrimitiveForm::Define),
    ("lambda", PrimitiveForm::Lambda),
    ("if", PrimitiveForm::If),
    ("set!", PrimitiveForm::Set),
    ("begin", PrimitiveForm::Begin),
    ("call/cc", PrimitiveForm::CallCc),
    ("call-with-current-continuation", PrimitiveForm::CallCc),
];

// -- argument accessors ----------------------------------------------------

fn number_arg(operation: &str, value: &Value) -> Result<Number, RuntimeError> {
    match value {
        Value::Number(n) => Ok(n.clone()),
        other => Err(RuntimeError::type_error(
            operation,
            format!("expected a number, got {}", other.type_name()),
        )),
    }
}

fn string_arg(operation: &str, value: &Value) -> Result<String, RuntimeError> {
    if let Value::String(node) = value
        && let NodeBody::Text(text) = &*node.body.borrow()
    {
        return Ok(text.clone());
    }
    Err(RuntimeError::type_error(
        operation,
        format!("expected a string, got {}", value.type_name()),
    ))
}

fn list_arg(operation: &str, value: &Value) -> Result<Vec<Value>, RuntimeError> {
    list_elements(value).ok_or_else(|| {
        RuntimeError::type_error(
            operation,
            format!("expected a proper list, got {}", value.type_name()),
        )
    })
}

fn index_arg(operation: &str, value: &Value, len: usize) -> Result<usize, RuntimeError> {
    match value {
        Value::Number(Number::Integer(i)) if *i >= 0 && (*i as usize) < len => Ok(*i as usize),
        // An exact integer that misses the bounds is a range error; any
        // other number was never a valid index to begin with.
        Value::Number(n @ (Number::Integer(_) | Number::Big(_))) => Err(RuntimeError::range(
            operation,
            format!("index {n} out of range for length {len}"),
        )),
        Value::Number(n) => Err(RuntimeError::type_error(
            operation,
            format!("expected an exact integer index, got {n}"),
        )),
        other => Err(RuntimeError::type_error(
            operation,
            format!("expected an index, got {}", other.type_name()),
        )),
    }
}

fn byte_arg(operation: &str, value: &Value) -> Result<u8, RuntimeError> {
    match value {
        Value::Number(Number::Integer(b)) if (0..=255).contains(b) => Ok(*b as u8),
        other => Err(RuntimeError::type_error(
            operation,
            format!("expected a byte in 0..=255, got {other}"),
        )),
    }
}

// -- pairs and lists -------------------------------------------------------

fn native_cons(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(heap.cons(args[0].clone(), args[1].clone()))
}

fn native_car(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    args[0]
        .car()
        .ok_or_else(|| RuntimeError::type_error("car", "expected a pair"))
}

fn native_cdr(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    args[0]
        .cdr()
        .ok_or_else(|| RuntimeError::type_error("cdr", "expected a pair"))
}

fn native_set_car(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Pair(node) = &args[0]
        && let NodeBody::Pair(car, _) = &mut *node.body.borrow_mut()
    {
        *car = args[1].clone();
        return Ok(Value::Unspecified);
    }
    Err(RuntimeError::type_error("set-car!", "expected a pair"))
}

fn native_set_cdr(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Pair(node) = &args[0]
        && let NodeBody::Pair(_, cdr) = &mut *node.body.borrow_mut()
    {
        *cdr = args[1].clone();
        return Ok(Value::Unspecified);
    }
    Err(RuntimeError::type_error("set-cdr!", "expected a pair"))
}

fn native_list(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(heap.list_from(args.to_vec()))
}

fn native_length(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let elements = list_arg("length", &args[0])?;
    Ok(Value::Number(Number::Integer(elements.len() as i64)))
}

fn native_append(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let Some((last, init)) = args.split_last() else {
        return Ok(Value::Null);
    };
    let mut items = Vec::new();
    for arg in init {
        items.extend(list_arg("append", arg)?);
    }
    Ok(heap.improper_from(items, last.clone()))
}

fn native_reverse(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut elements = list_arg("reverse", &args[0])?;
    elements.reverse();
    Ok(heap.list_from(elements))
}

/// Proper-list check. Cyclic chains are not proper lists, so the walk
/// keeps a visited set instead of looping forever.
fn native_is_list(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut visited = HashSet::new();
    let mut cursor = args[0].clone();
    loop {
        match cursor {
            Value::Null => return Ok(Value::Boolean(true)),
            Value::Pair(node) => {
                if !visited.insert(Rc::as_ptr(&node) as usize) {
                    return Ok(Value::Boolean(false));
                }
                match &*node.body.borrow() {
                    NodeBody::Pair(_, cdr) => cursor = cdr.clone(),
                    _ => return Ok(Value::Boolean(false)),
                }
            }
            _ => return Ok(Value::Boolean(false)),
        }
    }
}

// -- equivalence and type predicates ---------------------------------------

fn native_eqv(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(eqv(&args[0], &args[1])))
}

fn native_equal(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(equal(&args[0], &args[1])))
}

fn native_not(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(args[0].is_false()))
}

fn native_is_pair(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Pair(_))))
}

fn native_is_null(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Null)))
}

fn native_is_symbol(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Symbol(_))))
}

fn native_is_string(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::String(_))))
}

fn native_is_char(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Character(_))))
}

fn native_is_boolean(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Boolean(_))))
}

fn native_is_procedure(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(
        args[0],
        Value::Closure(_) | Value::Native(_)
    )))
}

fn native_is_vector(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Vector(_))))
}

fn native_is_bytevector(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Bytevector(_))))
}

fn native_is_number(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Number(_))))
}

fn native_is_integer(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(
        &args[0],
        Value::Number(n) if n.is_integer_valued()
    )))
}

fn native_is_rational(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(
        &args[0],
        Value::Number(n) if n.is_rational_valued()
    )))
}

fn native_is_real(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Number(_))))
}

fn native_is_zero(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(number_arg("zero?", &args[0])?.is_zero()))
}

// -- arithmetic ------------------------------------------------------------

fn native_add(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut sum = Number::Integer(0);
    for arg in args {
        sum = sum.add(&number_arg("+", arg)?);
    }
    Ok(Value::Number(sum))
}

fn native_sub(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let first = number_arg("-", &args[0])?;
    if args.len() == 1 {
        return Ok(Value::Number(first.neg()));
    }
    let mut result = first;
    for arg in &args[1..] {
        result = result.sub(&number_arg("-", arg)?);
    }
    Ok(Value::Number(result))
}

fn native_mul(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut product = Number::Integer(1);
    for arg in args {
        product = product.mul(&number_arg("*", arg)?);
    }
    Ok(Value::Number(product))
}

fn native_div(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let first = number_arg("/", &args[0])?;
    if args.len() == 1 {
        return Number::Integer(1)
            .div(&first)
            .map(Value::Number)
            .ok_or_else(|| RuntimeError::divide_by_zero("/"));
    }
    let mut result = first;
    for arg in &args[1..] {
        result = result
            .div(&number_arg("/", arg)?)
            .ok_or_else(|| RuntimeError::divide_by_zero("/"))?;
    }
    Ok(Value::Number(result))
}

macro_rules! numeric_comparison {
    ($fn_name:ident, $op_name:expr, $keep:expr) => {
        fn $fn_name(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
            let mut prev = number_arg($op_name, &args[0])?;
            for arg in &args[1..] {
                let current = number_arg($op_name, arg)?;
                let ordering = prev.partial_cmp(&current);
                if !$keep(ordering) {
                    return Ok(Value::Boolean(false));
                }
                prev = current;
            }
            Ok(Value::Boolean(true))
        }
    };
}

numeric_comparison!(native_num_eq, "=", |o| o == Some(Ordering::Equal));
numeric_comparison!(native_lt, "<", |o| o == Some(Ordering::Less));
numeric_comparison!(native_le, "<=", |o| matches!(
    o,
    Some(Ordering::Less) | Some(Ordering::Equal)
));
numeric_comparison!(native_gt, ">", |o| o == Some(Ordering::Greater));
numeric_comparison!(native_ge, ">=", |o| matches!(
    o,
    Some(Ordering::Greater) | Some(Ordering::Equal)
));

// -- vectors ---------------------------------------------------------------

fn native_vector(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(heap.vector_value(args.to_vec()))
}

fn native_make_vector(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let len = match number_arg("make-vector", &args[0])? {
        Number::Integer(n) if n >= 0 => n as usize,
        n => {
            return Err(RuntimeError::type_error(
                "make-vector",
                format!("expected a non-negative length, got {n}"),
            ));
        }
    };
    let fill = args.get(1).cloned().unwrap_or(Value::Unspecified);
    Ok(heap.vector_value(vec![fill; len]))
}

fn native_vector_ref(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Vector(node) = &args[0]
        && let NodeBody::Vector(items) = &*node.body.borrow()
    {
        let index = index_arg("vector-ref", &args[1], items.len())?;
        return Ok(items[index].clone());
    }
    Err(RuntimeError::type_error("vector-ref", "expected a vector"))
}

fn native_vector_set(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Vector(node) = &args[0] {
        let mut body = node.body.borrow_mut();
        if let NodeBody::Vector(items) = &mut *body {
            let index = index_arg("vector-set!", &args[1], items.len())?;
            items[index] = args[2].clone();
            return Ok(Value::Unspecified);
        }
    }
    Err(RuntimeError::type_error("vector-set!", "expected a vector"))
}

fn native_vector_length(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Vector(node) = &args[0]
        && let NodeBody::Vector(items) = &*node.body.borrow()
    {
        return Ok(Value::Number(Number::Integer(items.len() as i64)));
    }
    Err(RuntimeError::type_error(
        "vector-length",
        "expected a vector",
    ))
}

// -- bytevectors -----------------------------------------------------------

fn native_bytevector(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut bytes = Vec::with_capacity(args.len());
    for arg in args {
        bytes.push(byte_arg("bytevector", arg)?);
    }
    Ok(heap.bytevector_value(bytes))
}

fn native_bytevector_u8_ref(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Bytevector(node) = &args[0]
        && let NodeBody::Bytevector(bytes) = &*node.body.borrow()
    {
        let index = index_arg("bytevector-u8-ref", &args[1], bytes.len())?;
        return Ok(Value::Number(Number::Integer(bytes[index] as i64)));
    }
    Err(RuntimeError::type_error(
        "bytevector-u8-ref",
        "expected a bytevector",
    ))
}

fn native_bytevector_length(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Value::Bytevector(node) = &args[0]
        && let NodeBody::Bytevector(bytes) = &*node.body.borrow()
    {
        return Ok(Value::Number(Number::Integer(bytes.len() as i64)));
    }
    Err(RuntimeError::type_error(
        "bytevector-length",
        "expected a bytevector",
    ))
}

// -- strings and symbols ---------------------------------------------------

fn native_string_length(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let text = string_arg("string-length", &args[0])?;
    Ok(Value::Number(Number::Integer(text.chars().count() as i64)))
}

fn native_string_append(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    for arg in args {
        out.push_str(&string_arg("string-append", arg)?);
    }
    Ok(heap.string_value(out))
}

fn native_string_to_symbol(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let text = string_arg("string->symbol", &args[0])?;
    Ok(Value::Symbol(text))
}

fn native_symbol_to_string(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Symbol(name) => Ok(heap.string_value(name.clone())),
        other => Err(RuntimeError::type_error(
            "symbol->string",
            format!("expected a symbol, got {}", other.type_name()),
        )),
    }
}

fn native_number_to_string(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let n = number_arg("number->string", &args[0])?;
    Ok(heap.string_value(format!("{n}")))
}

// -- output ----------------------------------------------------------------

fn native_display(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    print!("{}", args[0].to_display_string());
    Ok(Value::Unspecified)
}

fn native_write(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    print!("{}", args[0]);
    Ok(Value::Unspecified)
}

fn native_newline(_heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    println!();
    Ok(Value::Unspecified)
}

/// The registry. The table is the single source of truth; the name index
/// below is derived from it lazily.
static NATIVE_OPS: &[NativeOp] = &[
    // Pairs and lists.
    NativeOp { name: "cons", arity: Arity::Exact(2), run: native_cons },
    NativeOp { name: "car", arity: Arity::Exact(1), run: native_car },
    NativeOp { name: "cdr", arity: Arity::Exact(1), run: native_cdr },
    NativeOp { name: "set-car!", arity: Arity::Exact(2), run: native_set_car },
    NativeOp { name: "set-cdr!", arity: Arity::Exact(2), run: native_set_cdr },
    NativeOp { name: "list", arity: Arity::Any, run: native_list },
    NativeOp { name: "length", arity: Arity::Exact(1), run: native_length },
    NativeOp { name: "append", arity: Arity::Any, run: native_append },
    NativeOp { name: "reverse", arity: Arity::Exact(1), run: native_reverse },
    NativeOp { name: "list?", arity: Arity::Exact(1), run: native_is_list },
    // Equivalence.
    NativeOp { name: "eq?", arity: Arity::Exact(2), run: native_eqv },
    NativeOp { name: "eqv?", arity: Arity::Exact(2), run: native_eqv },
    NativeOp { name: "equal?", arity: Arity::Exact(2), run: native_equal },
    NativeOp { name: "not", arity: Arity::Exact(1), run: native_not },
    // Type predicates.
    NativeOp { name: "pair?", arity: Arity::Exact(1), run: native_is_pair },
    NativeOp { name: "null?", arity: Arity::Exact(1), run: native_is_null },
    NativeOp { name: "symbol?", arity: Arity::Exact(1), run: native_is_symbol },
    NativeOp { name: "string?", arity: Arity::Exact(1), run: native_is_string },
    NativeOp { name: "char?", arity: Arity::Exact(1), run: native_is_char },
    NativeOp { name: "boolean?", arity: Arity::Exact(1), run: native_is_boolean },
    NativeOp { name: "procedure?", arity: Arity::Exact(1), run: native_is_procedure },
    NativeOp { name: "vector?", arity: Arity::Exact(1), run: native_is_vector },
    NativeOp { name: "bytevector?", arity: Arity::Exact(1), run: native_is_bytevector },
    NativeOp { name: "number?", arity: Arity::Exact(1), run: native_is_number },
    NativeOp { name: "integer?", arity: Arity::Exact(1), run: native_is_integer },
    NativeOp { name: "rational?", arity: Arity::Exact(1), run: native_is_rational },
    NativeOp { name: "real?", arity: Arity::Exact(1), run: native_is_real },
    NativeOp { name: "zero?", arity: Arity::Exact(1), run: native_is_zero },
    // Arithmetic and comparison.
    NativeOp { name: "+", arity: Arity::Any, run: native_add },
    NativeOp { name: "-", arity: Arity::AtLeast(1), run: native_sub },
    NativeOp { name: "*", arity: Arity::Any, run: native_mul },
    NativeOp { name: "/", arity: Arity::AtLeast(1), run: native_div },
    NativeOp { name: "=", arity: Arity::AtLeast(2), run: native_num_eq },
    NativeOp { name: "<", arity: Arity::AtLeast(2), run: native_lt },
    NativeOp { name: "<=", arity: Arity::AtLeast(2), run: native_le },
    NativeOp { name: ">", arity: Arity::AtLeast(2), run: native_gt },
    NativeOp { name: ">=", arity: Arity::AtLeast(2), run: native_ge },
    // Vectors.
    NativeOp { name: "vector", arity: Arity::Any, run: native_vector },
    NativeOp { name: "make-vector", arity: Arity::Range(1, 2), run: native_make_vector },
    NativeOp { name: "vector-ref", arity: Arity::Exact(2), run: native_vector_ref },
    NativeOp { name: "vector-set!", arity: Arity::Exact(3), run: native_vector_set },
    NativeOp { name: "vector-length", arity: Arity::Exact(1), run: native_vector_length },
    // Bytevectors.
    NativeOp { name: "bytevector", arity: Arity::Any, run: native_bytevector },
    NativeOp { name: "bytevector-u8-ref", arity: Arity::Exact(2), run: native_bytevector_u8_ref },
    NativeOp { name: "bytevector-length", arity: Arity::Exact(1), run: native_bytevector_length },
    // Strings and symbols.
    NativeOp { name: "string-length", arity: Arity::Exact(1), run: native_string_length },
    NativeOp { name: "string-append", arity: Arity::Any, run: native_string_append },
    NativeOp { name: "string->symbol", arity: Arity::Exact(1), run: native_string_to_symbol },
    NativeOp { name: "symbol->string", arity: Arity::Exact(1), run: native_symbol_to_string },
    NativeOp { name: "number->string", arity: Arity::Exact(1), run: native_number_to_string },
    // Output.
    NativeOp { name: "display", arity: Arity::Exact(1), run: native_display },
    NativeOp { name: "write", arity: Arity::Exact(1), run: native_write },
    NativeOp { name: "newline", arity: Arity::Exact(0), run: native_newline },
];

static NATIVE_INDEX: LazyLock<HashMap<&'static str, &'static NativeOp>> =
    LazyLock::new(|| NATIVE_OPS.iter().map(|op| (op.name, op)).collect());

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Number(Number::Integer(i))
    }

    fn call(heap: &mut Heap, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let op = find_native(name).unwrap_or_else(|| panic!("no native named {name}"));
        op.arity.validate(op.name, args.len())?;
        (op.run)(heap, &args)
    }

    #[test]
    fn test_install_seeds_environment() {
        let mut heap = Heap::new();
        let env = EnvRef::new(&mut heap, None);
        install(&mut heap, &env);

        assert!(matches!(env.lookup("cons"), Some(Value::Native(_))));
        assert!(matches!(env.lookup("+"), Some(Value::Native(_))));
        assert!(matches!(
            env.lookup("quote"),
            Some(Value::PrimitiveForm(PrimitiveForm::Quote))
        ));
        assert!(matches!(
            env.lookup("call-with-current-continuation"),
            Some(Value::PrimitiveForm(PrimitiveForm::CallCc))
        ));
    }

    #[test]
    fn test_arithmetic_natives() {
        let mut heap = Heap::new();
        let cases: Vec<(&str, Vec<Value>, &str)> = vec![
            ("+", vec![], "0"),
            ("+", vec![int(1), int(2), int(3)], "6"),
            ("*", vec![], "1"),
            ("*", vec![int(2), int(3), int(7)], "42"),
            ("-", vec![int(5)], "-5"),
            ("-", vec![int(10), int(4), int(1)], "5"),
            ("/", vec![int(2)], "1/2"),
            ("/", vec![int(1), int(3)], "1/3"),
            ("/", vec![int(6), int(3)], "2"),
        ];
        for (name, args, expected) in cases {
            let result = call(&mut heap, name, args).unwrap();
            assert_eq!(format!("{result}"), expected, "native {name}");
        }

        let err = call(&mut heap, "/", vec![int(1), int(0)]).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_DIVIDE_BY_ZERO);

        let err = call(&mut heap, "+", vec![Value::Boolean(true)]).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_TYPE);
    }

    #[test]
    fn test_comparison_chains() {
        let mut heap = Heap::new();
        let cases: Vec<(&str, Vec<Value>, bool)> = vec![
            ("<", vec![int(1), int(2), int(3)], true),
            ("<", vec![int(1), int(3), int(2)], false),
            ("<=", vec![int(1), int(1), int(2)], true),
            ("=", vec![int(4), int(4), int(4)], true),
            ("=", vec![int(4), int(5)], false),
            (">", vec![int(3), int(2), int(1)], true),
            (">=", vec![int(3), int(3), int(4)], false),
        ];
        for (name, args, expected) in cases {
            let result = call(&mut heap, name, args).unwrap();
            assert_eq!(
                result.as_bool(),
                Some(expected),
                "comparison {name}"
            );
        }
    }

    #[test]
    fn test_list_natives() {
        let mut heap = Heap::new();
        let pair = call(&mut heap, "cons", vec![int(1), int(2)]).unwrap();
        assert_eq!(format!("{pair}"), "(1 . 2)");

        let list = call(&mut heap, "list", vec![int(1), int(2), int(3)]).unwrap();
        assert_eq!(format!("{list}"), "(1 2 3)");
        let len = call(&mut heap, "length", vec![list.clone()]).unwrap();
        assert!(eqv(&len, &int(3)));

        let reversed = call(&mut heap, "reverse", vec![list.clone()]).unwrap();
        assert_eq!(format!("{reversed}"), "(3 2 1)");

        let tail = call(&mut heap, "list", vec![int(9)]).unwrap();
        let appended = call(&mut heap, "append", vec![list.clone(), tail]).unwrap();
        assert_eq!(format!("{appended}"), "(1 2 3 9)");

        call(&mut heap, "set-car!", vec![pair.clone(), int(7)]).unwrap();
        assert_eq!(format!("{pair}"), "(7 . 2)");
        call(&mut heap, "set-cdr!", vec![pair.clone(), Value::Null]).unwrap();
        assert_eq!(format!("{pair}"), "(7)");

        assert_eq!(
            call(&mut heap, "list?", vec![pair]).unwrap().as_bool(),
            Some(true)
        );
        assert_eq!(
            call(&mut heap, "list?", vec![int(3)]).unwrap().as_bool(),
            Some(false)
        );

        let err = call(&mut heap, "car", vec![int(3)]).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_TYPE);
    }

    #[test]
    fn test_list_predicate_handles_cycles() {
        let mut heap = Heap::new();
        let cycle = heap.cons(int(1), Value::Null);
        if let Value::Pair(node) = &cycle {
            *node.body.borrow_mut() = NodeBody::Pair(int(1), cycle.clone());
        }
        let result = call(&mut heap, "list?", vec![cycle]).unwrap();
        assert_eq!(result.as_bool(), Some(false));
    }

    #[test]
    fn test_vector_natives() {
        let mut heap = Heap::new();
        let v = call(&mut heap, "vector", vec![int(1), int(2)]).unwrap();
        assert_eq!(format!("{v}"), "#(1 2)");

        call(&mut heap, "vector-set!", vec![v.clone(), int(0), int(9)]).unwrap();
        let first = call(&mut heap, "vector-ref", vec![v.clone(), int(0)]).unwrap();
        assert!(eqv(&first, &int(9)));

        let len = call(&mut heap, "vector-length", vec![v.clone()]).unwrap();
        assert!(eqv(&len, &int(2)));

        // Out-of-bounds integers are range errors; non-integer numbers
        // were never valid indexes and are type errors.
        let half = Value::Number(Number::parse("1/2").unwrap());
        let err = call(&mut heap, "vector-ref", vec![v.clone(), half]).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_TYPE);
        let err = call(
            &mut heap,
            "vector-ref",
            vec![v.clone(), Value::Number(Number::Real(1.5))],
        )
        .unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_TYPE);
        let err = call(&mut heap, "vector-ref", vec![v, int(5)]).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_RANGE);

        let made = call(&mut heap, "make-vector", vec![int(3), int(0)]).unwrap();
        assert_eq!(format!("{made}"), "#(0 0 0)");
    }

    #[test]
    fn test_bytevector_natives() {
        let mut heap = Heap::new();
        let bv = call(&mut heap, "bytevector", vec![int(1), int(255)]).unwrap();
        assert_eq!(format!("{bv}"), "#u8(1 255)");

        let b = call(&mut heap, "bytevector-u8-ref", vec![bv.clone(), int(1)]).unwrap();
        assert!(eqv(&b, &int(255)));
        let len = call(&mut heap, "bytevector-length", vec![bv]).unwrap();
        assert!(eqv(&len, &int(2)));

        let err = call(&mut heap, "bytevector", vec![int(300)]).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_TYPE);
    }

    #[test]
    fn test_string_natives() {
        let mut heap = Heap::new();
        let a = heap.string_value("foo".into());
        let b = heap.string_value("bar".into());
        let joined = call(&mut heap, "string-append", vec![a.clone(), b]).unwrap();
        assert_eq!(format!("{joined}"), "\"foobar\"");

        let len = call(&mut heap, "string-length", vec![a.clone()]).unwrap();
        assert!(eqv(&len, &int(3)));

        let symbol = call(&mut heap, "string->symbol", vec![a]).unwrap();
        assert!(matches!(symbol, Value::Symbol(ref s) if s == "foo"));

        let back = call(&mut heap, "symbol->string", vec![symbol]).unwrap();
        assert_eq!(format!("{back}"), "\"foo\"");

        let text = call(&mut heap, "number->string", vec![int(42)]).unwrap();
        assert_eq!(format!("{text}"), "\"42\"");
    }

    #[test]
    fn test_arity_contracts() {
        assert!(Arity::Exact(2).validate("x", 2).is_ok());
        assert!(Arity::Exact(2).validate("x", 3).is_err());
        assert!(Arity::AtLeast(1).validate("x", 5).is_ok());
        assert!(Arity::AtLeast(1).validate("x", 0).is_err());
        assert!(Arity::Range(1, 2).validate("x", 2).is_ok());
        assert!(Arity::Range(1, 2).validate("x", 3).is_err());
        assert!(Arity::Any.validate("x", 17).is_ok());

        let err = Arity::Exact(1).validate("car", 2).unwrap_err();
        assert_eq!(err.code, crate::codes::RUNTIME_ARITY);
        assert_eq!(err.operation.as_deref(), Some("car"));
    }
}
